use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::Notify;
use zbus::message::Header;
use zbus::names::BusName;

use crate::authority::{Authority, CallContext, Caller};
use crate::cache::PackageSystem;
use crate::protocol::TransitionError;
use crate::service::TransitionService;

/// The service as seen on the bus.
pub struct TransitionInterface<P: PackageSystem, A> {
    service: Arc<TransitionService<P, A>>,
    shutdown: Arc<Notify>,
}

impl<P: PackageSystem, A: Authority> TransitionInterface<P, A> {
    pub fn new(service: Arc<TransitionService<P, A>>, shutdown: Arc<Notify>) -> Self {
        Self { service, shutdown }
    }
}

/// Resolves the caller of the current message. A message without a sender
/// did not come through the bus daemon and is treated as local.
async fn call_context(
    header: &Header<'_>,
    connection: &zbus::Connection,
) -> Result<CallContext, TransitionError> {
    let Some(sender) = header.sender() else {
        return Ok(CallContext::Local);
    };

    let dbus = zbus::fdo::DBusProxy::new(connection).await?;
    let pid = dbus
        .get_connection_unix_process_id(BusName::from(sender.to_owned()))
        .await
        .map_err(|e| TransitionError::AuthorityFailed(format!("unknown caller {sender}: {e}")))?;

    Ok(CallContext::Remote(Caller {
        sender: sender.to_string(),
        pid,
    }))
}

#[zbus::interface(name = "org.pop_os.transition_system.Interface")]
impl<P, A> TransitionInterface<P, A>
where
    P: PackageSystem + 'static,
    A: Authority + 'static,
{
    async fn obtain_lock(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.obtain_lock(&context).await
    }

    async fn release_lock(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.release_lock(&context).await
    }

    async fn open_cache(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.open_cache(&context).await
    }

    async fn mark_package_for_removal(
        &self,
        name: String,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<String, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.mark_package_for_removal(&context, &name).await
    }

    async fn commit_changes(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.commit_changes(&context).await
    }

    async fn close_cache(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.close_cache(&context).await
    }

    async fn remove_packages(
        &self,
        names: Vec<String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<bool, TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.remove_packages(&context, &names).await
    }

    async fn exit(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> Result<(), TransitionError> {
        let context = call_context(&header, connection).await?;
        self.service.exit(&context).await?;

        tracing::info!(target: "TransitionSystem::Server", "Exit requested");
        self.shutdown.notify_one();
        Ok(())
    }
}

/// Frees the package lock whenever the client holding it drops off the bus.
/// Runs until the bus connection closes.
pub async fn watch_holders<P, A>(
    connection: zbus::Connection,
    service: Arc<TransitionService<P, A>>,
) -> zbus::Result<()>
where
    P: PackageSystem,
    A: Authority,
{
    let dbus = zbus::fdo::DBusProxy::new(&connection).await?;
    let mut owner_changes = dbus.receive_name_owner_changed().await?;

    while let Some(change) = owner_changes.next().await {
        let args = match change.args() {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(target: "TransitionSystem::Server", "Bad NameOwnerChanged: {e}");
                continue;
            }
        };

        if args.new_owner().is_none() {
            service.release_holder(args.name().as_str()).await;
        }
    }

    Ok(())
}
