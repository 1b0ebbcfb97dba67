pub mod client;
pub mod config;
pub mod coordinator;
pub mod outcome;

pub use client::TransitionClient;
pub use coordinator::{Coordinator, Progress, RetryPolicy, RunHandle};
pub use outcome::{RemovalOutcome, Report, RunError, RunSummary};
