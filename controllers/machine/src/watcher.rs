//! Kubernetes resource watchers.
//!
//! Machines are driven by a `kube_runtime::Controller`. Provider kinds are
//! only known at runtime, so each one gets its own dynamic watcher once the
//! watch registry asks for it; changes to a provider record are mapped back to
//! the machines referencing it and fed into the controller via `reconcile_on`.

use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconcile_helpers::external_references;
use crate::reconciler::Reconciler;
use crate::watch_registry::WatchInstaller;
use async_trait::async_trait;
use crds::{Machine, ObjectReference};
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender};
use kube::Api;
use kube::api::DynamicObject;
use kube::discovery::Scope;
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{
    Controller, WatchStreamExt,
    controller::{self, Action, Config as ControllerConfig},
    watcher,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store_client::KubeStore;
use tracing::{debug, error, info, warn};

/// Shared state handed to every reconciliation.
#[derive(Debug)]
pub struct Context {
    /// Machine reconciler
    pub reconciler: Arc<Reconciler>,
    /// Reconcile metrics
    pub metrics: Metrics,
}

/// Build the Machine controller. Provider-triggered passes arrive on `triggers`.
pub fn machine_controller(
    api: Api<Machine>,
    concurrency: u16,
    triggers: UnboundedReceiver<ObjectRef<Machine>>,
) -> Controller<Machine> {
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(concurrency);

    Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .reconcile_on(triggers)
}

/// Drive `controller` until a shutdown signal arrives.
///
/// # Errors
///
/// Currently always returns `Ok` once the controller stream ends.
pub async fn run_machine_controller(
    controller: Controller<Machine>,
    context: Arc<Context>,
) -> Result<(), ControllerError> {
    info!("Starting Machine watcher");

    controller
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|res| async move {
            match res {
                Ok((machine, _action)) => debug!("Reconciled Machine {}", machine),
                // Already reported by error_policy
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(e) => warn!("Machine controller error: {}", e),
            }
        })
        .await;

    info!("Machine watcher stopped");
    Ok(())
}

async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let namespace = machine.namespace_or_default();
    let name = machine.name_or_empty();
    debug!("Reconciling Machine {}/{}", namespace, name);

    let started = Instant::now();
    let result = ctx.reconciler.reconcile(namespace, name).await;
    let label = match &result {
        Ok(Some(_)) => "requeue",
        Ok(None) => "success",
        Err(_) => "error",
    };
    ctx.metrics.observe(label, started.elapsed());

    Ok(match result? {
        Some(delay) => Action::requeue(delay),
        None => Action::await_change(),
    })
}

fn error_policy(machine: Arc<Machine>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let key = format!("{}/{}", machine.namespace_or_default(), machine.name_or_empty());
    let delay = ctx.reconciler.error_backoff(&key);
    if error.is_transient() {
        warn!("Reconciliation of Machine {} hit a transient error: {} (retrying in {:?})", key, error, delay);
    } else {
        error!("Reconciliation failed for Machine {}: {} (retrying in {:?})", key, error, delay);
    }
    Action::requeue(delay)
}

/// Installs dynamic watches for provider kinds against the API server.
#[derive(Clone)]
pub struct KubeWatchInstaller {
    store: KubeStore,
    machines: Store<Machine>,
    trigger: UnboundedSender<ObjectRef<Machine>>,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeWatchInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchInstaller")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeWatchInstaller {
    /// `machines` is the controller's reflector cache, used to map provider
    /// changes back to machines.
    pub fn new(
        store: KubeStore,
        machines: Store<Machine>,
        trigger: UnboundedSender<ObjectRef<Machine>>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            store,
            machines,
            trigger,
            namespace,
        }
    }
}

#[async_trait]
impl WatchInstaller for KubeWatchInstaller {
    async fn install(&self, reference: &ObjectReference) -> Result<(), ControllerError> {
        let (resource, capabilities) = self.store.resolve(reference).await?;
        let client = self.store.client().clone();
        let namespace = outside_namespace(self.namespace.as_deref(), reference).or(self.namespace.as_deref());
        let api: Api<DynamicObject> = match (namespace, capabilities.scope) {
            (Some(namespace), Scope::Namespaced) => Api::namespaced_with(client, namespace, &resource),
            _ => Api::all_with(client, &resource),
        };

        let key = self.watch_key(reference);
        let api_version = reference.api_version.clone();
        let kind = reference.kind.clone();
        let machines = self.machines.clone();
        let trigger = self.trigger.clone();

        tokio::spawn(async move {
            let mut records = watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .boxed();

            while let Some(event) = records.next().await {
                let record = match event {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Watch for {} failed: {}", key, e);
                        continue;
                    }
                };
                for machine in machines_referencing(&machines.state(), &api_version, &kind, &record) {
                    if trigger.unbounded_send(machine).is_err() {
                        debug!("Machine controller is gone, stopping watch for {}", key);
                        return;
                    }
                }
            }
        });

        Ok(())
    }

    /// A reference into a namespace other than the watched one gets a watch of its own.
    fn watch_key(&self, reference: &ObjectReference) -> String {
        match outside_namespace(self.namespace.as_deref(), reference) {
            Some(namespace) => format!("{}@{}", reference.kind_key(), namespace),
            None => reference.kind_key(),
        }
    }
}

/// Explicit namespace of `reference` when it lies outside the watched `namespace`.
fn outside_namespace<'a>(namespace: Option<&str>, reference: &'a ObjectReference) -> Option<&'a str> {
    let watched = namespace?;
    reference.namespace.as_deref().filter(|ns| *ns != watched)
}

/// Machines whose bootstrap or infrastructure reference points at `record`.
fn machines_referencing(
    machines: &[Arc<Machine>],
    api_version: &str,
    kind: &str,
    record: &DynamicObject,
) -> Vec<ObjectRef<Machine>> {
    let Some(name) = record.metadata.name.as_deref() else {
        return Vec::new();
    };
    let record_namespace = record.metadata.namespace.as_deref();

    machines
        .iter()
        .filter(|machine| {
            let namespace = machine.namespace_or_default();
            external_references(machine).iter().any(|reference| {
                reference.api_version == api_version
                    && reference.kind == kind
                    && reference.name == name
                    && record_namespace.is_none_or(|ns| reference.namespace_or(namespace) == ns)
            })
        })
        .map(|machine| ObjectRef::from_obj(machine.as_ref()))
        .collect()
}
