//! Reconciliation logic for Machines.
//!
//! One pass loads the machine and walks it through either the deletion path
//! or the normal path:
//! - `phase`: pure phase derivation
//! - `external`: bootstrap and infrastructure provider reconciliation
//! - `delete`: teardown of provider records ahead of finalizer removal

pub mod delete;
pub mod external;
pub mod phase;

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;
use crate::reconcile_helpers::{
    add_finalizer, external_references, has_finalizer, has_owner_references, remove_finalizer, sooner,
};
use crate::watch_registry::WatchRegistry;
use crds::{MACHINE_FINALIZER, Machine, MachinePhase};
use delete::reconcile_delete;
use external::{ReferenceKind, reconcile_reference};
use kube::Resource;
use phase::compute_phase;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use store_client::ObjectStore;
use tracing::{debug, info, warn};

/// Timing knobs for reconciliation passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Requeue delay while a provider is missing or not ready
    pub external_ready_wait: Duration,
    /// Requeue delay while provider records are being deleted
    pub delete_requeue: Duration,
    /// Deadline for a single pass
    pub reconcile_timeout: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            external_ready_wait: Duration::from_secs(30),
            delete_requeue: Duration::from_secs(10),
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// Backoff state for a machine whose passes keep failing
#[derive(Debug, Clone, Default)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Reconciles Machines against their bootstrap and infrastructure providers.
pub struct Reconciler {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) watches: Arc<WatchRegistry>,
    pub(crate) settings: ReconcileSettings,
    /// Error backoff per machine (namespace/name -> BackoffState)
    backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("watches", &self.watches)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler over `store`, installing provider watches through `watches`.
    pub fn new(store: Arc<dyn ObjectStore>, watches: Arc<WatchRegistry>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            watches,
            settings,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one reconciliation pass for the machine `namespace/name`.
    ///
    /// Returns the delay after which the machine should be looked at again,
    /// or `None` when only a change notification should trigger the next pass.
    ///
    /// # Errors
    ///
    /// Returns any error the pass could not absorb into a requeue decision,
    /// including `ControllerError::Timeout` when the pass exceeds its deadline.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Option<Duration>, ControllerError> {
        let deadline = self.settings.reconcile_timeout;
        let result = match tokio::time::timeout(deadline, self.reconcile_machine(namespace, name)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ControllerError::Timeout(deadline)),
        };
        if result.is_ok() {
            self.reset_backoff(&format!("{namespace}/{name}"));
        }
        result
    }

    /// Next retry delay for a machine whose pass failed.
    pub fn error_backoff(&self, key: &str) -> Duration {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(key.to_string()).or_default();
        state.error_count += 1;
        let delay = state.backoff.next_backoff();
        debug!("Machine {} failed {} time(s), retrying in {:?}", key, state.error_count, delay);
        delay
    }

    fn reset_backoff(&self, key: &str) {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        if states.remove(key).is_some() {
            debug!("Reset error backoff for Machine {}", key);
        }
    }

    async fn reconcile_machine(&self, namespace: &str, name: &str) -> Result<Option<Duration>, ControllerError> {
        let Some(machine) = self.store.get_machine(namespace, name).await? else {
            debug!("Machine {}/{} not found, assuming it was deleted", namespace, name);
            return Ok(None);
        };

        if machine.being_deleted() {
            return self.reconcile_deleting(machine).await;
        }

        let mut machine = self.ensure_finalizer(machine).await?;
        let before = machine.clone();
        let mut requeue = None;

        if !self.ensure_cluster_owner(&mut machine).await? {
            requeue = Some(self.settings.external_ready_wait);
        }

        let result = self.reconcile_external(&mut machine).await;

        let status = machine.status_mut();
        match &result {
            Ok(_) => status.message = None,
            Err(e) if e.is_diagnostic() => status.message = Some(e.to_string()),
            Err(_) => {}
        }
        let previous = before.status.as_ref().map(|s| s.phase);
        status.phase = compute_phase(status, false);
        let phase = status.phase;
        if previous != Some(phase) {
            info!("Machine {}/{} is now {}", namespace, name, phase);
        }

        self.persist(&before, machine).await?;

        let waiting_on_provider = result?;
        if waiting_on_provider || phase == MachinePhase::Provisioned {
            requeue = sooner(requeue, Some(self.settings.external_ready_wait));
        }
        Ok(requeue)
    }

    async fn ensure_finalizer(&self, mut machine: Machine) -> Result<Machine, ControllerError> {
        if !add_finalizer(&mut machine.metadata, MACHINE_FINALIZER) {
            return Ok(machine);
        }
        let status = machine.status.clone();
        let mut updated = self.store.update_machine(&machine).await?;
        updated.status = status;
        info!(
            "Added finalizer to Machine {}/{}",
            updated.namespace_or_default(),
            updated.name_or_empty()
        );
        Ok(updated)
    }

    /// Attach the declared Cluster as owner. Returns `false` if the cluster
    /// does not exist yet and the pass should come back later.
    async fn ensure_cluster_owner(&self, machine: &mut Machine) -> Result<bool, ControllerError> {
        let Some(cluster_name) = machine.spec.cluster_name.clone().filter(|n| !n.is_empty()) else {
            return Ok(true);
        };
        if has_owner_references(&machine.metadata) {
            return Ok(true);
        }

        let namespace = machine.namespace_or_default().to_string();
        let Some(cluster) = self.store.get_cluster(&namespace, &cluster_name).await? else {
            info!(
                "Cluster {}/{} for Machine {} not found, skipping owner reference",
                namespace,
                cluster_name,
                machine.name_or_empty()
            );
            return Ok(false);
        };
        let Some(owner) = cluster.owner_ref(&()) else {
            warn!("Cluster {}/{} has no uid yet", namespace, cluster_name);
            return Ok(false);
        };

        machine.metadata.owner_references.get_or_insert_with(Vec::new).push(owner);
        Ok(true)
    }

    /// Watch, then reconcile, bootstrap and infrastructure. Returns `true`
    /// when either provider is missing or not ready.
    async fn reconcile_external(&self, machine: &mut Machine) -> Result<bool, ControllerError> {
        for reference in external_references(machine) {
            self.watches.ensure_watch(&reference).await?;
        }

        let bootstrap = reconcile_reference(self.store.as_ref(), machine, ReferenceKind::Bootstrap).await;
        let infrastructure = reconcile_reference(self.store.as_ref(), machine, ReferenceKind::Infrastructure).await;
        let bootstrap = bootstrap?;
        let infrastructure = infrastructure?;

        debug!(
            "Machine {}/{} bootstrap {:?}, infrastructure {:?}",
            machine.namespace_or_default(),
            machine.name_or_empty(),
            bootstrap,
            infrastructure
        );
        Ok(bootstrap.needs_requeue() || infrastructure.needs_requeue())
    }

    async fn reconcile_deleting(&self, mut machine: Machine) -> Result<Option<Duration>, ControllerError> {
        let key = format!("{}/{}", machine.namespace_or_default(), machine.name_or_empty());
        if !has_finalizer(&machine.metadata, MACHINE_FINALIZER) {
            debug!("Machine {} is being deleted and holds no finalizer of ours", key);
            return Ok(None);
        }

        let result = reconcile_delete(self.store.as_ref(), &machine).await;

        let before = machine.status.clone();
        let status = machine.status_mut();
        status.phase = compute_phase(status, true);
        if machine.status != before {
            info!("Machine {} is now {}", key, MachinePhase::Deleting);
            machine = self.store.update_machine_status(&machine).await?;
        }

        if !result? {
            debug!("Machine {} is waiting for provider records to be deleted", key);
            return Ok(Some(self.settings.delete_requeue));
        }

        remove_finalizer(&mut machine.metadata, MACHINE_FINALIZER);
        self.store.update_machine(&machine).await?;
        info!("Removed finalizer from Machine {}", key);
        Ok(None)
    }

    /// Write back what changed since `before`: metadata and spec first, then status.
    async fn persist(&self, before: &Machine, mut machine: Machine) -> Result<(), ControllerError> {
        if machine.metadata != before.metadata || machine.spec != before.spec {
            let status = machine.status.clone();
            machine = self.store.update_machine(&machine).await?;
            machine.status = status;
        }
        if machine.status != before.status {
            self.store.update_machine_status(&machine).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "machine_test.rs"]
mod machine_test;
