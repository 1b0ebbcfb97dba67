use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

use transition_system::authority::{AuthorizationGate, Polkit};
use transition_system::cache::Apt;
use transition_system::config::{self, ServiceConfig};
use transition_system::protocol::{BUS_NAME, OBJECT_PATH, REMOVE_PRIVILEGE};
use transition_system::server::{self, TransitionInterface};
use transition_system::{logging, TransitionService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    tracing::info!(
        target: "TransitionSystem::Main",
        "Starting v{}...",
        env!("CARGO_PKG_VERSION")
    );

    let config = ServiceConfig::load(config::DEFAULT_PATH);
    if !config.enforce_polkit {
        tracing::warn!(
            target: "TransitionSystem::Main",
            "Polkit enforcement is disabled, every caller is authorized"
        );
    }

    let gate = AuthorizationGate::new(Polkit::new(config.authorization_timeout()), REMOVE_PRIVILEGE)
        .enforce(config.enforce_polkit);
    let service = Arc::new(TransitionService::new(
        Apt::new(&config.lock_path, config.refresh_index),
        gate,
    ));
    let shutdown = Arc::new(Notify::new());

    tracing::info!(target: "TransitionSystem::Main", "Requesting bus name {BUS_NAME}...");
    let connection = config
        .bus
        .builder()?
        .name(BUS_NAME)?
        .serve_at(
            OBJECT_PATH,
            TransitionInterface::new(service.clone(), shutdown.clone()),
        )?
        .build()
        .await?;
    tracing::info!(target: "TransitionSystem::Main", "Serving D-Bus requests...");

    tokio::spawn({
        let connection = connection.clone();
        let service = service.clone();
        async move {
            if let Err(e) = server::watch_holders(connection, service).await {
                tracing::error!(target: "TransitionSystem::Main", "Lock holder watch failed: {e}");
            }
        }
    });

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = shutdown.notified() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "TransitionSystem::Main", "Interrupted");
        }
        _ = terminate.recv() => {
            tracing::info!(target: "TransitionSystem::Main", "Terminated");
        }
    }

    service.shutdown().await;
    tracing::info!(target: "TransitionSystem::Main", "Exiting");

    Ok(())
}
