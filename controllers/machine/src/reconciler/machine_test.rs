//! Reconciliation pass tests for the normal (non-deleting) path

use super::*;
use crate::test_utils::*;
use async_trait::async_trait;
use crds::{Cluster, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::json;
use store_client::{DynamicObject, MockObjectStore, StoreError};

const NS: &str = "default";
const WAIT: Option<Duration> = Some(Duration::from_secs(30));

fn stored(store: &MockObjectStore, name: &str) -> Machine {
    store.machine(NS, name).unwrap()
}

fn stored_status(store: &MockObjectStore, name: &str) -> crds::MachineStatus {
    stored(store, name).status.unwrap_or_default()
}

fn ready_bootstrap() -> DynamicObject {
    bootstrap_record(NS, json!({ "ready": true, "bootstrapData": "#!/bin/bash ... data" }))
}

fn ready_infrastructure(addresses: Option<serde_json::Value>) -> DynamicObject {
    let mut status = json!({ "ready": true });
    if let Some(addresses) = addresses {
        status["addresses"] = addresses;
    }
    infrastructure_record(NS, json!({ "providerID": "test://id-1" }), status)
}

fn node_ref() -> ObjectReference {
    ObjectReference::new("v1", "Node", "node-1")
}

#[tokio::test]
async fn test_missing_machine_is_not_an_error() {
    let store = MockObjectStore::new();
    let (reconciler, installer) = create_test_reconciler(&store);

    assert_eq!(reconciler.reconcile(NS, "nope").await.unwrap(), None);
    assert_eq!(installer.total_installs(), 0);
}

#[tokio::test]
async fn test_scenario_a_new_machine_with_empty_providers_is_pending() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-a", NS));
    store.add_external(bootstrap_record(NS, json!({})));
    store.add_external(infrastructure_record(NS, json!({}), json!({})));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-a").await.unwrap();

    assert_eq!(requeue, WAIT);
    let machine = stored(&store, "machine-a");
    assert!(has_finalizer(&machine.metadata, MACHINE_FINALIZER));
    assert_eq!(machine.status.unwrap_or_default().phase, MachinePhase::Pending);
}

#[tokio::test]
async fn test_scenario_b_bootstrap_ready_is_provisioning() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-b", NS));
    store.add_external(ready_bootstrap());
    store.add_external(infrastructure_record(NS, json!({}), json!({ "ready": false })));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-b").await.unwrap();

    assert_eq!(requeue, WAIT);
    let machine = stored(&store, "machine-b");
    assert_eq!(machine.spec.bootstrap.data.as_deref(), Some("#!/bin/bash ... data"));
    let status = machine.status.unwrap_or_default();
    assert!(status.bootstrap_ready);
    assert!(!status.infrastructure_ready);
    assert_eq!(status.phase, MachinePhase::Provisioning);
}

#[tokio::test]
async fn test_scenario_c_both_ready_without_node_is_provisioned() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-c", NS));
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(Some(json!([
        { "type": "InternalIP", "address": "10.0.0.1" },
        { "type": "InternalIP", "address": "10.0.0.2" },
    ]))));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-c").await.unwrap();

    assert_eq!(requeue, WAIT, "requeue until the node reference appears");
    let status = stored_status(&store, "machine-c");
    assert_eq!(status.phase, MachinePhase::Provisioned);
    assert_eq!(status.addresses.len(), 2);
    assert_eq!(status.provider_id.as_deref(), Some("test://id-1"));
}

#[tokio::test]
async fn test_scenario_d_absent_addresses_are_valid() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-d", NS));
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-d").await.unwrap();

    let status = stored_status(&store, "machine-d");
    assert_eq!(status.phase, MachinePhase::Provisioned);
    assert!(status.addresses.is_empty());
    assert_eq!(status.message, None);
}

#[tokio::test]
async fn test_scenario_e_node_ref_means_running_without_requeue() {
    let store = MockObjectStore::new();
    let mut machine = create_test_machine("machine-e", NS);
    machine.status_mut().node_ref = Some(node_ref());
    store.add_machine(machine);
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-e").await.unwrap();

    assert_eq!(requeue, None);
    assert_eq!(stored_status(&store, "machine-e").phase, MachinePhase::Running);
}

#[tokio::test]
async fn test_scenario_g_infrastructure_deleted_under_running_machine_fails() {
    let store = MockObjectStore::new();
    let mut machine = create_test_machine("machine-g", NS);
    machine.status_mut().node_ref = Some(node_ref());
    store.add_machine(machine);
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-g").await.unwrap();
    assert_eq!(stored_status(&store, "machine-g").phase, MachinePhase::Running);

    store.remove_external(&infrastructure_ref(), NS);
    let result = reconciler.reconcile(NS, "machine-g").await;

    assert!(matches!(result, Err(ControllerError::InfrastructureLost(_))));
    let status = stored_status(&store, "machine-g");
    assert_eq!(status.phase, MachinePhase::Failed);
    assert!(status.error_reason.is_some_and(|r| !r.is_empty()));
    assert!(status.error_message.is_some_and(|m| !m.is_empty()));
}

#[tokio::test]
async fn test_machine_progresses_as_providers_become_ready() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.add_external(bootstrap_record(NS, json!({})));
    store.add_external(infrastructure_record(NS, json!({}), json!({})));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();
    assert_eq!(stored_status(&store, "machine-1").phase, MachinePhase::Pending);

    store
        .set_external_field(&bootstrap_ref(), NS, &["status"], json!({ "ready": true, "bootstrapData": "data" }))
        .unwrap();
    reconciler.reconcile(NS, "machine-1").await.unwrap();
    assert_eq!(stored_status(&store, "machine-1").phase, MachinePhase::Provisioning);

    store
        .set_external_field(&infrastructure_ref(), NS, &["status", "ready"], json!(true))
        .unwrap();
    reconciler.reconcile(NS, "machine-1").await.unwrap();
    assert_eq!(stored_status(&store, "machine-1").phase, MachinePhase::Provisioned);

    // Bootstrap regressing afterwards does not reset readiness
    store
        .set_external_field(&bootstrap_ref(), NS, &["status", "ready"], json!(false))
        .unwrap();
    reconciler.reconcile(NS, "machine-1").await.unwrap();
    let status = stored_status(&store, "machine-1");
    assert!(status.bootstrap_ready);
    assert_eq!(status.phase, MachinePhase::Provisioned);
}

#[tokio::test]
async fn test_missing_providers_requeue_without_mutating_flags() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(requeue, WAIT);
    let status = stored_status(&store, "machine-1");
    assert!(!status.bootstrap_ready);
    assert!(!status.infrastructure_ready);
    assert_eq!(status.phase, MachinePhase::Pending);
}

#[tokio::test]
async fn test_watches_installed_once_per_kind() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.add_machine(create_test_machine("machine-2", NS));
    let (reconciler, installer) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();
    reconciler.reconcile(NS, "machine-2").await.unwrap();
    reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(installer.installs(&bootstrap_ref().kind_key()), 1);
    assert_eq!(installer.installs(&infrastructure_ref().kind_key()), 1);
    assert!(reconciler.watches.is_watched(&bootstrap_ref()));
}

#[tokio::test]
async fn test_failed_watch_install_fails_the_pass_but_keeps_finalizer() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    let (reconciler, installer) = create_test_reconciler(&store);
    installer.fail_installs(true);

    let result = reconciler.reconcile(NS, "machine-1").await;

    assert!(matches!(result, Err(ControllerError::Watch(_))));
    assert!(has_finalizer(&stored(&store, "machine-1").metadata, MACHINE_FINALIZER));
}

#[tokio::test]
async fn test_finalizer_added_alongside_foreign_finalizers() {
    let store = MockObjectStore::new();
    let mut machine = create_test_machine("machine-1", NS);
    machine.metadata.finalizers = Some(vec!["example.com/keep".to_string()]);
    store.add_machine(machine);
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(
        stored(&store, "machine-1").metadata.finalizers,
        Some(vec!["example.com/keep".to_string(), MACHINE_FINALIZER.to_string()])
    );
}

#[tokio::test]
async fn test_cluster_owner_reference_attached() {
    let store = MockObjectStore::new();
    let cluster: Cluster = store.add_cluster(create_test_cluster("test-cluster", NS));
    let mut machine = create_test_machine("machine-1", NS);
    machine.spec.cluster_name = Some("test-cluster".to_string());
    store.add_machine(machine);
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();

    let owners = stored(&store, "machine-1").metadata.owner_references.unwrap_or_default();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].kind, "Cluster");
    assert_eq!(owners[0].api_version, "cluster.x-k8s.io/v1alpha3");
    assert_eq!(owners[0].name, "test-cluster");
    assert_eq!(Some(&owners[0].uid), cluster.metadata.uid.as_ref());
}

#[tokio::test]
async fn test_existing_owner_is_never_overwritten() {
    let store = MockObjectStore::new();
    store.add_cluster(create_test_cluster("test-cluster", NS));
    let machine_set_owner = OwnerReference {
        api_version: "cluster.x-k8s.io/v1alpha3".to_string(),
        kind: "MachineSet".to_string(),
        name: "ms1".to_string(),
        uid: "ms1-uid".to_string(),
        ..Default::default()
    };
    let mut machine = create_test_machine("machine-1", NS);
    machine.spec.cluster_name = Some("test-cluster".to_string());
    machine.metadata.owner_references = Some(vec![machine_set_owner.clone()]);
    store.add_machine(machine);
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(
        stored(&store, "machine-1").metadata.owner_references,
        Some(vec![machine_set_owner])
    );
}

#[tokio::test]
async fn test_missing_cluster_requeues_without_owner() {
    let store = MockObjectStore::new();
    let mut machine = create_test_machine("machine-1", NS);
    machine.spec.cluster_name = Some("not-yet".to_string());
    machine.status_mut().node_ref = Some(node_ref());
    store.add_machine(machine);
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    let requeue = reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(requeue, WAIT);
    let machine = stored(&store, "machine-1");
    assert!(machine.metadata.owner_references.is_none_or(|o| o.is_empty()));
    assert_eq!(machine.status.unwrap_or_default().phase, MachinePhase::Running);
}

#[tokio::test]
async fn test_invalid_provider_state_is_recorded_as_diagnostic() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.add_external(bootstrap_record(NS, json!({ "ready": true })));
    store.add_external(infrastructure_record(NS, json!({}), json!({})));
    let (reconciler, _) = create_test_reconciler(&store);

    let result = reconciler.reconcile(NS, "machine-1").await;

    assert!(matches!(result, Err(ControllerError::InvalidState(_))));
    let status = stored_status(&store, "machine-1");
    assert!(status.message.is_some_and(|m| m.contains("bootstrapData")));
    assert_eq!(status.phase, MachinePhase::Pending, "a diagnostic does not fail the machine");

    // Provider fixes itself: the diagnostic is cleared on the next clean pass
    store
        .set_external_field(&bootstrap_ref(), NS, &["status", "bootstrapData"], json!("data"))
        .unwrap();
    reconciler.reconcile(NS, "machine-1").await.unwrap();
    let status = stored_status(&store, "machine-1");
    assert_eq!(status.message, None);
    assert_eq!(status.phase, MachinePhase::Provisioning);
}

#[tokio::test]
async fn test_infrastructure_still_reconciled_when_bootstrap_fails() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.add_external(bootstrap_record(NS, json!({ "ready": true })));
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    assert!(reconciler.reconcile(NS, "machine-1").await.is_err());
    assert!(stored_status(&store, "machine-1").infrastructure_ready);
}

#[tokio::test]
async fn test_transient_store_error_is_returned_without_diagnostic() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.fail_external_reads(true);
    let (reconciler, _) = create_test_reconciler(&store);

    let result = reconciler.reconcile(NS, "machine-1").await;

    assert!(matches!(result, Err(ControllerError::Store(StoreError::Unavailable(_)))));
    assert_eq!(stored_status(&store, "machine-1").message, None);
}

#[tokio::test]
async fn test_provider_reported_failure_fails_machine() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    store.add_external(ready_bootstrap());
    store.add_external(infrastructure_record(
        NS,
        json!({}),
        json!({ "errorReason": "CreateError", "errorMessage": "quota exceeded" }),
    ));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();

    let status = stored_status(&store, "machine-1");
    assert_eq!(status.phase, MachinePhase::Failed);
    assert_eq!(status.error_reason.as_deref(), Some("CreateError"));
}

#[tokio::test]
async fn test_unchanged_machine_is_not_rewritten() {
    let store = MockObjectStore::new();
    let mut machine = create_test_machine("machine-1", NS);
    machine.status_mut().node_ref = Some(node_ref());
    store.add_machine(machine);
    store.add_external(ready_bootstrap());
    store.add_external(ready_infrastructure(None));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.reconcile(NS, "machine-1").await.unwrap();
    let version = stored(&store, "machine-1").metadata.resource_version;

    reconciler.reconcile(NS, "machine-1").await.unwrap();
    assert_eq!(stored(&store, "machine-1").metadata.resource_version, version);
}

#[test]
fn test_error_backoff_grows_and_resets() {
    let store = MockObjectStore::new();
    let (reconciler, _) = create_test_reconciler(&store);

    assert_eq!(reconciler.error_backoff("default/m"), Duration::from_secs(5));
    assert_eq!(reconciler.error_backoff("default/m"), Duration::from_secs(5));
    assert_eq!(reconciler.error_backoff("default/m"), Duration::from_secs(10));
    // Independent per machine
    assert_eq!(reconciler.error_backoff("default/other"), Duration::from_secs(5));

    reconciler.reset_backoff("default/m");
    assert_eq!(reconciler.error_backoff("default/m"), Duration::from_secs(5));
}

#[tokio::test]
async fn test_successful_pass_resets_backoff() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    let (reconciler, _) = create_test_reconciler(&store);

    reconciler.error_backoff("default/machine-1");
    reconciler.error_backoff("default/machine-1");
    reconciler.reconcile(NS, "machine-1").await.unwrap();

    assert_eq!(reconciler.error_backoff("default/machine-1"), Duration::from_secs(5));
}

/// Store whose machine reads never complete in time
struct SlowStore(MockObjectStore, Duration);

#[async_trait]
impl ObjectStore for SlowStore {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError> {
        tokio::time::sleep(self.1).await;
        self.0.get_machine(namespace, name).await
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.0.update_machine(machine).await
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError> {
        self.0.update_machine_status(machine).await
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        self.0.get_cluster(namespace, name).await
    }

    async fn get_external(
        &self,
        reference: &ObjectReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        self.0.get_external(reference, namespace).await
    }

    async fn delete_external(&self, reference: &ObjectReference, namespace: &str) -> Result<(), StoreError> {
        self.0.delete_external(reference, namespace).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_pass_is_cancelled_at_deadline() {
    let store = MockObjectStore::new();
    store.add_machine(create_test_machine("machine-1", NS));
    let installer = Arc::new(RecordingInstaller::default());
    let reconciler = Reconciler::new(
        Arc::new(SlowStore(store.clone(), Duration::from_secs(600))),
        Arc::new(WatchRegistry::new(installer)),
        test_settings(),
    );

    let result = reconciler.reconcile(NS, "machine-1").await;

    assert!(matches!(result, Err(ControllerError::Timeout(_))));
    assert!(!has_finalizer(&stored(&store, "machine-1").metadata, MACHINE_FINALIZER));
}
