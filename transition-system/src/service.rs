use tokio::sync::Mutex;

use crate::authority::{Authority, AuthorizationGate, CallContext};
use crate::cache::{CacheSession, PackageSystem};
use crate::protocol::TransitionError;

/// Where a service instance is in the lock/cache lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Unlocked,
    Locked,
    CacheOpen,
}

/// Who took the package lock.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Holder {
    Local,
    /// Unique bus name of a remote caller.
    Bus(String),
}

impl From<&CallContext> for Holder {
    fn from(context: &CallContext) -> Self {
        match context {
            CallContext::Local => Holder::Local,
            CallContext::Remote(caller) => Holder::Bus(caller.sender.clone()),
        }
    }
}

struct OpenCache<S> {
    session: S,
    committed: bool,
}

struct State<P: PackageSystem> {
    lock: Option<P::Lock>,
    holder: Option<Holder>,
    cache: Option<OpenCache<P::Session>>,
}

impl<P: PackageSystem> State<P> {
    fn phase(&self) -> Phase {
        match (&self.lock, &self.cache) {
            (None, _) => Phase::Unlocked,
            (Some(_), None) => Phase::Locked,
            (Some(_), Some(_)) => Phase::CacheOpen,
        }
    }

    fn held_by(&self, context: &CallContext) -> bool {
        self.lock.is_some() && self.holder.as_ref() == Some(&Holder::from(context))
    }

    /// Fails unless `context` took the lock.
    fn check_holder(&self, context: &CallContext, operation: &str) -> Result<(), TransitionError> {
        if self.lock.is_none() {
            return Err(TransitionError::OutOfOrder(format!(
                "{operation} requires the package lock"
            )));
        }
        if !self.held_by(context) {
            return Err(TransitionError::OutOfOrder(format!(
                "{operation}: the package lock belongs to another caller"
            )));
        }
        Ok(())
    }

    fn close_cache(&mut self) -> bool {
        match self.cache.take() {
            Some(cache) => {
                tracing::info!(
                    target: "TransitionSystem::Service",
                    "Closing package cache ({} staged, committed: {})",
                    cache.session.marked().len(),
                    cache.committed
                );
                true
            }
            None => false,
        }
    }

    fn release_lock(&mut self) -> bool {
        self.close_cache();
        self.holder = None;
        match self.lock.take() {
            Some(lock) => {
                drop(lock);
                tracing::info!(target: "TransitionSystem::Service", "Package lock released");
                true
            }
            None => false,
        }
    }
}

/// Sole owner of the package-manager lock and the package cache.
///
/// Every operation passes the authorization gate first. Ordering is checked
/// here as well: the cache opens only under the lock, and marks and commits
/// need an open cache. The lock belongs to the caller that took it; other
/// callers cannot drive or release it.
pub struct TransitionService<P: PackageSystem, A> {
    packages: P,
    gate: AuthorizationGate<A>,
    state: Mutex<State<P>>,
}

impl<P: PackageSystem, A: Authority> TransitionService<P, A> {
    pub fn new(packages: P, gate: AuthorizationGate<A>) -> Self {
        Self {
            packages,
            gate,
            state: Mutex::new(State {
                lock: None,
                holder: None,
                cache: None,
            }),
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase()
    }

    pub fn packages(&self) -> &P {
        &self.packages
    }

    pub async fn obtain_lock(&self, context: &CallContext) -> Result<bool, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        if state.held_by(context) {
            // A retry after a lost reply.
            tracing::info!(target: "TransitionSystem::Service", "Caller already holds the package lock");
            return Ok(true);
        }
        if state.lock.is_some() {
            tracing::warn!(
                target: "TransitionSystem::Service",
                "Package lock already held by {:?}",
                state.holder
            );
            return Ok(false);
        }

        self.acquire(&mut state, Holder::from(context))
    }

    fn acquire(&self, state: &mut State<P>, holder: Holder) -> Result<bool, TransitionError> {
        match self
            .packages
            .try_lock()
            .map_err(|e| TransitionError::PackageSystem(e.to_string()))?
        {
            Some(lock) => {
                tracing::info!(
                    target: "TransitionSystem::Service",
                    "Package lock obtained by {holder:?}"
                );
                state.lock = Some(lock);
                state.holder = Some(holder);
                Ok(true)
            }
            None => {
                tracing::info!(
                    target: "TransitionSystem::Service",
                    "Package lock is held by another process"
                );
                Ok(false)
            }
        }
    }

    pub async fn release_lock(&self, context: &CallContext) -> Result<bool, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        if state.lock.is_some() && !state.held_by(context) {
            tracing::warn!(
                target: "TransitionSystem::Service",
                "Refusing to release a package lock held by {:?}",
                state.holder
            );
            return Ok(false);
        }
        Ok(state.release_lock())
    }

    pub async fn open_cache(&self, context: &CallContext) -> Result<bool, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        state.check_holder(context, "OpenCache")?;
        if state.phase() == Phase::CacheOpen {
            return Ok(true);
        }

        tracing::info!(target: "TransitionSystem::Service", "Refreshing package index");
        self.packages
            .refresh_index()
            .await
            .map_err(|e| TransitionError::PackageSystem(e.to_string()))?;

        let session = self
            .packages
            .open_cache()
            .await
            .map_err(|e| TransitionError::PackageSystem(e.to_string()))?;
        state.cache = Some(OpenCache {
            session,
            committed: false,
        });
        tracing::info!(target: "TransitionSystem::Service", "Package cache opened");

        Ok(true)
    }

    /// Returns the resolved package name, or an empty string when the package
    /// is unknown to the cache.
    pub async fn mark_package_for_removal(
        &self,
        context: &CallContext,
        name: &str,
    ) -> Result<String, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        state.check_holder(context, "MarkPackageForRemoval")?;
        let Some(cache) = state.cache.as_mut() else {
            return Err(TransitionError::OutOfOrder(
                "MarkPackageForRemoval requires an open cache".into(),
            ));
        };

        match cache.session.mark_delete(name) {
            Some(resolved) => {
                tracing::info!(target: "TransitionSystem::Service", "Marked {resolved} for removal");
                Ok(resolved)
            }
            None => {
                tracing::warn!(target: "TransitionSystem::Service", "Package {name:?} not found");
                Ok(String::new())
            }
        }
    }

    pub async fn commit_changes(&self, context: &CallContext) -> Result<bool, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        state.check_holder(context, "CommitChanges")?;
        let Some(cache) = state.cache.as_mut() else {
            return Err(TransitionError::OutOfOrder(
                "CommitChanges requires an open cache".into(),
            ));
        };
        if cache.committed {
            return Err(TransitionError::OutOfOrder(
                "changes were already committed in this cache session".into(),
            ));
        }

        cache.committed = true;
        cache.session.commit().await.map_err(|e| {
            tracing::error!(target: "TransitionSystem::Service", "Commit failed: {e}");
            TransitionError::PackageSystem(e.to_string())
        })?;
        tracing::info!(target: "TransitionSystem::Service", "Changes committed");

        Ok(true)
    }

    pub async fn close_cache(&self, context: &CallContext) -> Result<bool, TransitionError> {
        self.gate.authorize(context).await?;

        let mut state = self.state.lock().await;
        if !state.held_by(context) {
            return Ok(false);
        }
        Ok(state.close_cache())
    }

    /// Runs the whole removal inside the service. The lock is released on
    /// every path once obtained. Returns `false` when the lock is busy or
    /// nothing could be marked.
    pub async fn remove_packages(
        &self,
        context: &CallContext,
        names: &[String],
    ) -> Result<bool, TransitionError> {
        // One authorization covers the whole sequence.
        self.gate.authorize(context).await?;
        let local = CallContext::Local;

        {
            // Never adopt a lock some other caller is still using.
            let mut state = self.state.lock().await;
            if state.lock.is_some() || !self.acquire(&mut state, Holder::Local)? {
                return Ok(false);
            }
        }

        let result = self.remove_locked(&local, names).await;
        self.state.lock().await.release_lock();
        result
    }

    async fn remove_locked(
        &self,
        local: &CallContext,
        names: &[String],
    ) -> Result<bool, TransitionError> {
        self.open_cache(local).await?;

        let mut marked = 0;
        for name in names {
            if !self.mark_package_for_removal(local, name).await?.is_empty() {
                marked += 1;
            }
        }

        if marked == 0 {
            return Ok(false);
        }

        self.commit_changes(local).await
    }

    /// Closes the cache and releases the lock ahead of shutdown.
    pub async fn exit(&self, context: &CallContext) -> Result<(), TransitionError> {
        self.gate.authorize(context).await?;
        self.shutdown().await;
        Ok(())
    }

    /// Drops the lock and cache when their holder has left the bus.
    pub async fn release_holder(&self, sender: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.lock.is_none() || state.holder != Some(Holder::Bus(sender.to_owned())) {
            return false;
        }

        tracing::warn!(
            target: "TransitionSystem::Service",
            "{sender} left the bus while holding the package lock"
        );
        state.release_lock()
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.release_lock() {
            tracing::warn!(
                target: "TransitionSystem::Service",
                "Released a package lock still held at shutdown"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;

    use super::*;
    use crate::authority::tests::{remote, ScriptedAuthority};
    use crate::authority::Caller;
    use crate::cache::PackageError;
    use crate::protocol::REMOVE_PRIVILEGE;

    /// In-memory package system shared with the test through `Arc`s.
    #[derive(Clone, Default)]
    pub(crate) struct FakePackages {
        pub installed: Arc<StdMutex<HashSet<String>>>,
        pub lock_busy: Arc<AtomicBool>,
        pub fail_commit: Arc<AtomicBool>,
        pub refreshes: Arc<AtomicUsize>,
        pub held: Arc<AtomicBool>,
    }

    impl FakePackages {
        pub(crate) fn with(installed: &[&str]) -> Self {
            let fake = Self::default();
            fake.installed
                .lock()
                .unwrap()
                .extend(installed.iter().map(|s| s.to_string()));
            fake
        }
    }

    pub(crate) struct FakeLock(Arc<AtomicBool>);

    impl Drop for FakeLock {
        fn drop(&mut self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeSession {
        packages: FakePackages,
        marked: Vec<String>,
    }

    #[async_trait]
    impl PackageSystem for FakePackages {
        type Lock = FakeLock;
        type Session = FakeSession;

        fn try_lock(&self) -> Result<Option<FakeLock>, PackageError> {
            if self.lock_busy.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.held.store(true, Ordering::SeqCst);
            Ok(Some(FakeLock(self.held.clone())))
        }

        async fn refresh_index(&self) -> Result<(), PackageError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn open_cache(&self) -> Result<FakeSession, PackageError> {
            Ok(FakeSession {
                packages: self.clone(),
                marked: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl CacheSession for FakeSession {
        fn mark_delete(&mut self, name: &str) -> Option<String> {
            if !self.packages.installed.lock().unwrap().contains(name) {
                return None;
            }
            self.marked.push(name.to_owned());
            Some(name.to_owned())
        }

        async fn commit(&mut self) -> Result<(), PackageError> {
            if self.packages.fail_commit.load(Ordering::SeqCst) {
                return Err(PackageError::Command {
                    program: "dpkg".into(),
                    status: "exit status: 2".into(),
                    stderr: "E: broken repository metadata".into(),
                });
            }
            let mut installed = self.packages.installed.lock().unwrap();
            for name in self.marked.drain(..) {
                installed.remove(&name);
            }
            Ok(())
        }

        fn marked(&self) -> &[String] {
            &self.marked
        }
    }

    fn service(packages: FakePackages) -> TransitionService<FakePackages, ScriptedAuthority> {
        TransitionService::new(
            packages,
            AuthorizationGate::new(ScriptedAuthority::default(), REMOVE_PRIVILEGE),
        )
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let packages = FakePackages::with(&["foo", "bar"]);
        let service = service(packages.clone());
        let ctx = CallContext::Local;

        assert_eq!(service.phase().await, Phase::Unlocked);
        assert!(service.obtain_lock(&ctx).await.unwrap());
        assert_eq!(service.phase().await, Phase::Locked);
        assert!(service.open_cache(&ctx).await.unwrap());
        assert_eq!(service.phase().await, Phase::CacheOpen);
        assert_eq!(packages.refreshes.load(Ordering::SeqCst), 1);

        assert_eq!(service.mark_package_for_removal(&ctx, "foo").await.unwrap(), "foo");
        assert_eq!(service.mark_package_for_removal(&ctx, "baz").await.unwrap(), "");
        assert!(service.commit_changes(&ctx).await.unwrap());
        assert!(service.close_cache(&ctx).await.unwrap());
        assert_eq!(service.phase().await, Phase::Locked);
        assert!(service.release_lock(&ctx).await.unwrap());
        assert_eq!(service.phase().await, Phase::Unlocked);

        assert!(!packages.held.load(Ordering::SeqCst));
        assert!(!packages.installed.lock().unwrap().contains("foo"));
    }

    #[tokio::test]
    async fn contended_lock_returns_false() {
        let packages = FakePackages::with(&[]);
        packages.lock_busy.store(true, Ordering::SeqCst);
        let service = service(packages);
        assert!(!service.obtain_lock(&CallContext::Local).await.unwrap());
        assert_eq!(service.phase().await, Phase::Unlocked);
    }

    fn other_caller() -> CallContext {
        CallContext::Remote(Caller {
            sender: ":1.77".into(),
            pid: 7777,
        })
    }

    #[tokio::test]
    async fn holder_relocking_succeeds_and_others_are_refused() {
        let service = service(FakePackages::with(&[]));
        let holder = remote();

        assert!(service.obtain_lock(&holder).await.unwrap());
        assert!(service.obtain_lock(&holder).await.unwrap());
        assert!(!service.obtain_lock(&other_caller()).await.unwrap());
        assert!(!service.obtain_lock(&CallContext::Local).await.unwrap());
        assert_eq!(service.phase().await, Phase::Locked);
    }

    #[tokio::test]
    async fn only_the_holder_drives_the_lock() {
        let packages = FakePackages::with(&["foo"]);
        let service = service(packages.clone());
        let holder = remote();
        let other = other_caller();
        service.obtain_lock(&holder).await.unwrap();

        assert!(matches!(
            service.open_cache(&other).await,
            Err(TransitionError::OutOfOrder(_))
        ));
        service.open_cache(&holder).await.unwrap();
        assert!(matches!(
            service.mark_package_for_removal(&other, "foo").await,
            Err(TransitionError::OutOfOrder(_))
        ));
        assert!(matches!(
            service.commit_changes(&other).await,
            Err(TransitionError::OutOfOrder(_))
        ));
        assert!(!service.close_cache(&other).await.unwrap());
        assert!(!service.release_lock(&other).await.unwrap());
        assert_eq!(service.phase().await, Phase::CacheOpen);

        assert!(service.release_lock(&holder).await.unwrap());
        assert!(!packages.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn holder_leaving_the_bus_frees_the_lock() {
        let packages = FakePackages::with(&[]);
        let service = service(packages.clone());
        service.obtain_lock(&remote()).await.unwrap();
        service.open_cache(&remote()).await.unwrap();

        assert!(!service.release_holder(":1.77").await);
        assert_eq!(service.phase().await, Phase::CacheOpen);

        assert!(service.release_holder(":1.42").await);
        assert_eq!(service.phase().await, Phase::Unlocked);
        assert!(!packages.held.load(Ordering::SeqCst));
        assert!(service.obtain_lock(&other_caller()).await.unwrap());
    }

    #[tokio::test]
    async fn remove_packages_leaves_a_held_lock_alone() {
        let packages = FakePackages::with(&["foo"]);
        let service = service(packages.clone());
        service.obtain_lock(&CallContext::Local).await.unwrap();

        let removed = service
            .remove_packages(&CallContext::Local, &["foo".into()])
            .await
            .unwrap();
        assert!(!removed);
        assert_eq!(service.phase().await, Phase::Locked);
        assert!(packages.installed.lock().unwrap().contains("foo"));
    }

    #[tokio::test]
    async fn release_without_lock_is_negative() {
        let service = service(FakePackages::with(&[]));
        let ctx = CallContext::Local;
        assert!(service.obtain_lock(&ctx).await.unwrap());
        assert!(service.release_lock(&ctx).await.unwrap());
        assert!(!service.release_lock(&ctx).await.unwrap());
        assert!(!service.release_lock(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn open_cache_requires_lock() {
        let packages = FakePackages::with(&[]);
        let service = service(packages.clone());
        assert!(matches!(
            service.open_cache(&CallContext::Local).await,
            Err(TransitionError::OutOfOrder(_))
        ));
        assert_eq!(packages.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mark_and_commit_require_open_cache() {
        let service = service(FakePackages::with(&["foo"]));
        let ctx = CallContext::Local;
        service.obtain_lock(&ctx).await.unwrap();

        assert!(matches!(
            service.mark_package_for_removal(&ctx, "foo").await,
            Err(TransitionError::OutOfOrder(_))
        ));
        assert!(matches!(
            service.commit_changes(&ctx).await,
            Err(TransitionError::OutOfOrder(_))
        ));
    }

    #[tokio::test]
    async fn commit_happens_at_most_once_per_session() {
        let service = service(FakePackages::with(&["foo"]));
        let ctx = CallContext::Local;
        service.obtain_lock(&ctx).await.unwrap();
        service.open_cache(&ctx).await.unwrap();
        service.mark_package_for_removal(&ctx, "foo").await.unwrap();

        assert!(service.commit_changes(&ctx).await.unwrap());
        assert!(matches!(
            service.commit_changes(&ctx).await,
            Err(TransitionError::OutOfOrder(_))
        ));
    }

    #[tokio::test]
    async fn commit_failure_carries_package_system_text() {
        let packages = FakePackages::with(&["foo"]);
        packages.fail_commit.store(true, Ordering::SeqCst);
        let service = service(packages);
        let ctx = CallContext::Local;
        service.obtain_lock(&ctx).await.unwrap();
        service.open_cache(&ctx).await.unwrap();
        service.mark_package_for_removal(&ctx, "foo").await.unwrap();

        match service.commit_changes(&ctx).await {
            Err(TransitionError::PackageSystem(text)) => {
                assert!(text.contains("broken repository metadata"), "{text}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_closes_open_cache() {
        let service = service(FakePackages::with(&[]));
        let ctx = CallContext::Local;
        service.obtain_lock(&ctx).await.unwrap();
        service.open_cache(&ctx).await.unwrap();
        assert!(service.release_lock(&ctx).await.unwrap());
        assert_eq!(service.phase().await, Phase::Unlocked);
        assert!(!service.close_cache(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn denied_caller_cannot_lock() {
        let packages = FakePackages::with(&[]);
        let service = TransitionService::new(
            packages.clone(),
            AuthorizationGate::new(ScriptedAuthority::with(vec![Ok(false)]), REMOVE_PRIVILEGE),
        );
        match service.obtain_lock(&remote()).await {
            Err(TransitionError::PermissionDeniedByPolicy(privilege)) => {
                assert_eq!(privilege, REMOVE_PRIVILEGE)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!packages.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn remove_packages_releases_after_commit_failure() {
        let packages = FakePackages::with(&["foo"]);
        packages.fail_commit.store(true, Ordering::SeqCst);
        let service = service(packages.clone());

        let result = service
            .remove_packages(&CallContext::Local, &["foo".into()])
            .await;
        assert!(matches!(result, Err(TransitionError::PackageSystem(_))));
        assert!(!packages.held.load(Ordering::SeqCst));
        assert_eq!(service.phase().await, Phase::Unlocked);
    }

    #[tokio::test]
    async fn remove_packages_skips_unknown_names() {
        let packages = FakePackages::with(&["foo"]);
        let service = service(packages.clone());

        let removed = service
            .remove_packages(&CallContext::Local, &["nope".into(), "foo".into()])
            .await
            .unwrap();
        assert!(removed);
        assert!(packages.installed.lock().unwrap().is_empty());

        let removed = service
            .remove_packages(&CallContext::Local, &["nope".into()])
            .await
            .unwrap();
        assert!(!removed);
        assert!(!packages.held.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn exit_releases_everything() {
        let packages = FakePackages::with(&[]);
        let service = service(packages.clone());
        let ctx = CallContext::Local;
        service.obtain_lock(&ctx).await.unwrap();
        service.open_cache(&ctx).await.unwrap();

        service.exit(&ctx).await.unwrap();
        assert_eq!(service.phase().await, Phase::Unlocked);
        assert!(!packages.held.load(Ordering::SeqCst));
    }
}
