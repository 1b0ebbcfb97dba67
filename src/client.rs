use async_trait::async_trait;
use transition_system::authority::{Authority, CallContext};
use transition_system::cache::PackageSystem;
use transition_system::{TransitionError, TransitionService, TransitionSystemProxy};

/// The privileged operations the coordinator drives.
#[async_trait]
pub trait TransitionClient: Send + Sync {
    async fn obtain_lock(&self) -> Result<bool, TransitionError>;
    async fn release_lock(&self) -> Result<bool, TransitionError>;
    async fn open_cache(&self) -> Result<bool, TransitionError>;
    async fn mark_package_for_removal(&self, name: &str) -> Result<String, TransitionError>;
    async fn commit_changes(&self) -> Result<bool, TransitionError>;
    async fn close_cache(&self) -> Result<bool, TransitionError>;
}

#[async_trait]
impl TransitionClient for TransitionSystemProxy<'static> {
    async fn obtain_lock(&self) -> Result<bool, TransitionError> {
        TransitionSystemProxy::obtain_lock(self).await
    }

    async fn release_lock(&self) -> Result<bool, TransitionError> {
        TransitionSystemProxy::release_lock(self).await
    }

    async fn open_cache(&self) -> Result<bool, TransitionError> {
        TransitionSystemProxy::open_cache(self).await
    }

    async fn mark_package_for_removal(&self, name: &str) -> Result<String, TransitionError> {
        TransitionSystemProxy::mark_package_for_removal(self, name).await
    }

    async fn commit_changes(&self) -> Result<bool, TransitionError> {
        TransitionSystemProxy::commit_changes(self).await
    }

    async fn close_cache(&self) -> Result<bool, TransitionError> {
        TransitionSystemProxy::close_cache(self).await
    }
}

/// In-process service, called without a remote identity.
#[async_trait]
impl<P, A> TransitionClient for TransitionService<P, A>
where
    P: PackageSystem + 'static,
    A: Authority + 'static,
{
    async fn obtain_lock(&self) -> Result<bool, TransitionError> {
        TransitionService::obtain_lock(self, &CallContext::Local).await
    }

    async fn release_lock(&self) -> Result<bool, TransitionError> {
        TransitionService::release_lock(self, &CallContext::Local).await
    }

    async fn open_cache(&self) -> Result<bool, TransitionError> {
        TransitionService::open_cache(self, &CallContext::Local).await
    }

    async fn mark_package_for_removal(&self, name: &str) -> Result<String, TransitionError> {
        TransitionService::mark_package_for_removal(self, &CallContext::Local, name).await
    }

    async fn commit_changes(&self) -> Result<bool, TransitionError> {
        TransitionService::commit_changes(self, &CallContext::Local).await
    }

    async fn close_cache(&self) -> Result<bool, TransitionError> {
        TransitionService::close_cache(self, &CallContext::Local).await
    }
}
