use tokio::signal::unix::{signal, SignalKind};

use crate::error::Result;
use crate::fleet::FleetManager;

/// Block until SIGTERM or SIGINT arrives.
pub async fn wait_for_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
}

/// Run the fleet until a shutdown signal, then drain it.
///
/// An interrupt goes through the same idempotent
/// [`FleetManager::shutdown`] used programmatically, so every node gets
/// a purge and broker termination regardless of how the process exits.
pub async fn run_until_signalled(fleet: &FleetManager) -> Result<()> {
    wait_for_signal().await;
    let nodes = fleet.node_ids().await;
    tracing::info!(nodes = nodes.len(), "Shutdown signal received, draining fleet");
    fleet.shutdown().await
}
