//! Drives one removal against the privileged service:
//! lock, open cache, mark, commit, close cache, release lock.
//!
//! The run happens on its own tokio task. The caller keeps the UI side: it
//! receives [`Progress`] events over a channel and the [`RunSummary`] from
//! [`RunHandle::finish`], so nothing the UI owns is touched from the task.
//!
//! Once the lock is obtained it is released before the run finishes, whatever
//! happens in between, including a panic in a later phase.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use transition_system::{PackageRequest, TransitionError};

use crate::client::TransitionClient;
use crate::outcome::{RemovalOutcome, RunError, RunSummary};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after the lock was found held by another process.
    pub contention_backoff: Duration,
    /// Pause after a transport or service error while locking.
    pub transient_backoff: Duration,
    /// Consecutive failed lock attempts (denials and errors) before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            contention_backoff: Duration::from_secs(5),
            transient_backoff: Duration::from_millis(500),
            max_attempts: 3,
        }
    }
}

/// Status updates for the UI, in the order they happen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    Waiting(PackageRequest),
    /// Another process holds the package lock; retrying after the backoff.
    LockBusy,
    Removing(PackageRequest),
    Committing,
}

pub struct Coordinator<C> {
    client: Arc<C>,
    policy: RetryPolicy,
}

impl<C: TransitionClient + 'static> Coordinator<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Starts a run on a background task.
    pub fn spawn(&self, requests: Vec<PackageRequest>) -> RunHandle {
        let (progress_tx, progress) = mpsc::unbounded_channel();
        let (cancel, cancel_rx) = watch::channel(false);

        let run = CoordinatorRun {
            client: self.client.clone(),
            policy: self.policy.clone(),
            outcomes: vec![RemovalOutcome::Skipped; requests.len()],
            requests: requests.clone(),
            marked: Vec::new(),
            error: None,
            progress: progress_tx,
            cancel: cancel_rx,
        };

        RunHandle {
            requests,
            progress,
            cancel,
            task: tokio::spawn(run.execute()),
        }
    }

    /// Runs to completion on the current task.
    pub async fn run(&self, requests: Vec<PackageRequest>) -> RunSummary {
        self.spawn(requests).finish().await
    }
}

/// The UI side of a running removal.
pub struct RunHandle {
    requests: Vec<PackageRequest>,
    progress: mpsc::UnboundedReceiver<Progress>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<RunSummary>,
}

impl RunHandle {
    /// `None` once the run has finished and every event was received.
    pub async fn next_progress(&mut self) -> Option<Progress> {
        self.progress.recv().await
    }

    /// Stops the run if it is still waiting for the package lock. After the
    /// lock is obtained the run always completes and this has no effect.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn finish(self) -> RunSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => RunSummary {
                outcomes: self
                    .requests
                    .into_iter()
                    .map(|request| (request, RemovalOutcome::Skipped))
                    .collect(),
                error: Some(RunError::Aborted(e.to_string())),
            },
        }
    }
}

struct CoordinatorRun<C> {
    client: Arc<C>,
    policy: RetryPolicy,
    requests: Vec<PackageRequest>,
    outcomes: Vec<RemovalOutcome>,
    /// Indices of requests staged in the service but not yet committed.
    marked: Vec<usize>,
    error: Option<RunError>,
    progress: mpsc::UnboundedSender<Progress>,
    cancel: watch::Receiver<bool>,
}

impl<C: TransitionClient> CoordinatorRun<C> {
    async fn execute(mut self) -> RunSummary {
        for request in &self.requests {
            self.emit(Progress::Waiting(request.clone()));
        }

        if let Err(e) = self.acquire_lock().await {
            tracing::error!(target: "PopTransition::Coordinator", "{e}");
            self.error = Some(e);
            return self.summary();
        }

        let locked = AssertUnwindSafe(self.while_locked()).catch_unwind().await;
        if let Err(panic) = locked {
            let message = panic_message(&*panic);
            tracing::error!(target: "PopTransition::Coordinator", "Removal panicked: {message}");
            self.discard_marked();
            self.error = Some(RunError::Aborted(message));
        }

        self.release_lock().await;
        self.summary()
    }

    async fn acquire_lock(&mut self) -> Result<(), RunError> {
        let mut failures = 0;

        loop {
            if *self.cancel.borrow() {
                return Err(RunError::Cancelled);
            }

            match self.client.obtain_lock().await {
                Ok(true) => {
                    tracing::info!(target: "PopTransition::Coordinator", "Package lock obtained");
                    return Ok(());
                }
                Ok(false) => {
                    tracing::info!(
                        target: "PopTransition::Coordinator",
                        "Package lock busy, retrying in {:?}",
                        self.policy.contention_backoff
                    );
                    self.emit(Progress::LockBusy);
                    self.pause(self.policy.contention_backoff).await?;
                }
                Err(TransitionError::PermissionDeniedByPolicy(privilege)) => {
                    failures += 1;
                    tracing::warn!(
                        target: "PopTransition::Coordinator",
                        "Not authorized for {privilege} (attempt {failures})"
                    );
                    if failures >= self.policy.max_attempts {
                        return Err(RunError::PermissionDenied(privilege));
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        target: "PopTransition::Coordinator",
                        "ObtainLock failed (attempt {failures}): {e}"
                    );
                    if failures >= self.policy.max_attempts {
                        return Err(RunError::LockUnavailable(e.to_string()));
                    }
                    self.pause(self.policy.transient_backoff).await?;
                }
            }
        }
    }

    async fn while_locked(&mut self) {
        match self.client.open_cache().await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(target: "PopTransition::Coordinator", "OpenCache was refused");
                self.error = Some(RunError::OpenCache("the service did not open it".into()));
                return;
            }
            Err(e) => {
                tracing::error!(target: "PopTransition::Coordinator", "OpenCache failed: {e}");
                self.error = Some(RunError::OpenCache(e.to_string()));
                return;
            }
        }

        self.mark_all().await;
        if !self.marked.is_empty() {
            self.commit().await;
        }

        match self.client.close_cache().await {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(target: "PopTransition::Coordinator", "CloseCache failed: {e}")
            }
        }
    }

    /// Marks in request order. An error stops the phase and drops every mark
    /// made so far: none of them can be reported as removed.
    async fn mark_all(&mut self) {
        for index in 0..self.requests.len() {
            let request = self.requests[index].clone();
            self.emit(Progress::Removing(request.clone()));

            match self.client.mark_package_for_removal(request.name()).await {
                Ok(resolved) if !resolved.is_empty() => self.marked.push(index),
                Ok(_) => {
                    tracing::warn!(
                        target: "PopTransition::Coordinator",
                        "{request} is not installed"
                    );
                    self.outcomes[index] = RemovalOutcome::Failed;
                }
                Err(e) => {
                    tracing::error!(
                        target: "PopTransition::Coordinator",
                        "Marking {request} failed: {e}"
                    );
                    self.outcomes[index] = RemovalOutcome::Failed;
                    self.discard_marked();
                    self.error = Some(RunError::Mark {
                        package: request.to_string(),
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    async fn commit(&mut self) {
        self.emit(Progress::Committing);

        let failure = match self.client.commit_changes().await {
            Ok(true) => None,
            Ok(false) => Some("the service did not commit".to_owned()),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                for index in self.marked.drain(..) {
                    self.outcomes[index] = RemovalOutcome::Removed;
                }
            }
            Some(message) => {
                tracing::error!(target: "PopTransition::Coordinator", "Commit failed: {message}");
                self.discard_marked();
                self.error = Some(RunError::Commit(message));
            }
        }
    }

    /// Runs until `ReleaseLock` succeeds. A `false` reply means the service
    /// holds no lock any more, which also ends the loop.
    async fn release_lock(&mut self) {
        loop {
            match self.client.release_lock().await {
                Ok(true) => {
                    tracing::info!(target: "PopTransition::Coordinator", "Package lock released");
                    return;
                }
                Ok(false) => {
                    tracing::warn!(
                        target: "PopTransition::Coordinator",
                        "Service reports no package lock to release"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        target: "PopTransition::Coordinator",
                        "ReleaseLock failed, retrying: {e}"
                    );
                    tokio::time::sleep(self.policy.transient_backoff).await;
                }
            }
        }
    }

    fn discard_marked(&mut self) {
        for index in self.marked.drain(..) {
            self.outcomes[index] = RemovalOutcome::Failed;
        }
    }

    /// Sleeps for `duration` unless the run is cancelled first.
    async fn pause(&mut self, duration: Duration) -> Result<(), RunError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancelled(&mut self.cancel) => Err(RunError::Cancelled),
        }
    }

    fn emit(&self, progress: Progress) {
        // The UI may have stopped listening; the run still has to finish.
        let _ = self.progress.send(progress);
    }

    fn summary(self) -> RunSummary {
        RunSummary {
            outcomes: self.requests.into_iter().zip(self.outcomes).collect(),
            error: self.error,
        }
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        // Handle dropped without cancelling.
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
