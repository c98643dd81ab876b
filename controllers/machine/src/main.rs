//! Machine Controller
//!
//! Drives cluster-api Machines through their lifecycle:
//! - ensures the controller's finalizer and the Cluster owner reference
//! - waits for the bootstrap provider and copies its bootstrap data
//! - waits for the infrastructure provider and copies provider ID and addresses
//! - derives the Machine phase and tears provider records down on deletion
//!
//! Provider kinds are discovered at runtime and watched on first use.

mod apply;
mod backoff;
mod config;
mod controller;
mod error;
mod metrics;
mod reconcile_helpers;
mod reconciler;
mod server;
mod watch_registry;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Settings;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Install the ring crypto provider before any TLS client is built
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Machine Controller");

    let settings = Settings::from_env()?;

    info!("Configuration:");
    info!("  Namespace: {}", settings.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  External ready wait: {:?}", settings.external_ready_wait);
    info!("  Delete requeue: {:?}", settings.delete_requeue);
    info!("  Reconcile timeout: {:?}", settings.reconcile_timeout);
    info!("  Max concurrent reconciles: {}", settings.max_concurrent_reconciles);
    info!("  Probe address: {}", settings.probe_bind_address);

    let controller = Controller::new(settings).await?;
    controller.run().await?;

    Ok(())
}
