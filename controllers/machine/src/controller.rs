//! Main controller implementation.
//!
//! Wires the Machine reconciler to the API server: applies the optional
//! component bundle, builds the kube-runtime controller and its provider
//! watches, and serves probes and metrics next to it.

use crate::apply::{KubeApplier, apply_until_ready};
use crate::config::Settings;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::server;
use crate::watch_registry::WatchRegistry;
use crate::watcher::{Context, KubeWatchInstaller, machine_controller, run_machine_controller};
use crds::Machine;
use kube::api::ListParams;
use kube::{Api, Client};
use prometheus::Registry;
use std::sync::Arc;
use store_client::KubeStore;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Main controller for Machine lifecycle management.
#[derive(Debug)]
pub struct Controller {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    ///
    /// # Errors
    ///
    /// Fails when the API server is unreachable, the Machine CRD is not
    /// served, the component bundle cannot be applied, or metrics cannot be
    /// registered.
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        info!("Initializing Machine Controller");

        let kube_client = Client::try_default().await?;
        let store = KubeStore::new(kube_client.clone());

        if let Some(path) = &settings.components_path {
            info!("Applying components from {}", path.display());
            let bundle = tokio::fs::read_to_string(path).await?;
            apply_until_ready(
                &KubeApplier::new(store.clone()),
                &bundle,
                settings.components_apply_interval,
                settings.components_apply_timeout,
            )
            .await?;
        }

        let machines: Api<Machine> = match &settings.namespace {
            Some(namespace) => Api::namespaced(kube_client.clone(), namespace),
            None => Api::all(kube_client.clone()),
        };
        machines.list(&ListParams::default().limit(1)).await.map_err(|e| {
            error!("Cannot list Machines: {}", e);
            error!("Please ensure the Machine CRD is installed and the service account may list it");
            ControllerError::Kube(e)
        })?;
        info!("API server reachable, Machine CRD served");

        let registry = Registry::new();
        let metrics = Metrics::new(&registry)?;

        let (trigger_tx, trigger_rx) = futures::channel::mpsc::unbounded();
        let controller = machine_controller(machines, settings.max_concurrent_reconciles, trigger_rx);
        let installer = KubeWatchInstaller::new(
            store.clone(),
            controller.store(),
            trigger_tx,
            settings.namespace.clone(),
        );
        let watches =
            Arc::new(WatchRegistry::new(Arc::new(installer)).with_gauge(metrics.watched_kinds.clone()));
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(store),
            watches,
            settings.reconcile_settings(),
        ));
        let context = Arc::new(Context { reconciler, metrics });

        let machine_watcher = tokio::spawn(run_machine_controller(controller, context));
        let probe_server = tokio::spawn(server::serve(settings.probe_bind_address, registry));

        Ok(Self {
            machine_watcher,
            probe_server,
        })
    }

    /// Runs until the machine watcher stops (shutdown signal) or a task fails.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Watch` if a task panicked, or the probe
    /// server's error if it could not serve.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Machine Controller running");

        tokio::select! {
            result = &mut self.machine_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Machine watcher panicked: {e}")))??;
            }
            result = &mut self.probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {e}")))??;
            }
        }

        info!("Machine Controller stopped");
        Ok(())
    }
}
