pub mod authority;
pub mod cache;
pub mod config;
pub mod lock;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod service;

pub use config::Bus;
pub use protocol::{PackageRequest, TransitionError, TransitionSystemProxy};
pub use service::{Phase, TransitionService};

/// Connects to the privileged service on `bus`.
pub async fn connect(bus: Bus) -> zbus::Result<TransitionSystemProxy<'static>> {
    let connection = bus.connect().await?;
    TransitionSystemProxy::new(&connection).await
}
