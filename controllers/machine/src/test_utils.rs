//! Test utilities for unit testing the Machine reconciler
//!
//! Builders for machines and provider records, and a recording watch
//! installer standing in for the kube-backed one.

use crate::error::ControllerError;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::watch_registry::{WatchInstaller, WatchRegistry};
use async_trait::async_trait;
use crds::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store_client::{DynamicObject, MockObjectStore};

pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1alpha3";
pub const INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1alpha3";

/// Reference to the default bootstrap config used by `create_test_machine`
pub fn bootstrap_ref() -> ObjectReference {
    ObjectReference::new(BOOTSTRAP_API_VERSION, "BootstrapConfig", "bootstrap-config1")
}

/// Reference to the default infrastructure config used by `create_test_machine`
pub fn infrastructure_ref() -> ObjectReference {
    ObjectReference::new(INFRASTRUCTURE_API_VERSION, "InfrastructureConfig", "infra-config1")
}

/// Helper to create a test Machine pointing at `bootstrap_ref()` and `infrastructure_ref()`
pub fn create_test_machine(name: &str, namespace: &str) -> Machine {
    Machine {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: MachineSpec {
            cluster_name: None,
            bootstrap: Bootstrap {
                config_ref: Some(bootstrap_ref()),
                data: None,
            },
            infrastructure_ref: infrastructure_ref(),
        },
        status: None,
    }
}

/// Helper to create a test Cluster
pub fn create_test_cluster(name: &str, namespace: &str) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec::default(),
    }
}

/// Helper to create an untyped provider record for `reference` with the given body
pub fn create_provider_record(reference: &ObjectReference, namespace: &str, body: Value) -> DynamicObject {
    let mut object = json!({
        "apiVersion": reference.api_version,
        "kind": reference.kind,
        "metadata": {
            "name": reference.name,
            "namespace": namespace,
        },
    });
    if let (Some(object), Some(body)) = (object.as_object_mut(), body.as_object()) {
        object.extend(body.clone());
    }
    serde_json::from_value(object).unwrap()
}

/// Bootstrap record with the given `status` block
pub fn bootstrap_record(namespace: &str, status: Value) -> DynamicObject {
    create_provider_record(&bootstrap_ref(), namespace, json!({ "status": status }))
}

/// Infrastructure record with the given `spec` and `status` blocks
pub fn infrastructure_record(namespace: &str, spec: Value, status: Value) -> DynamicObject {
    create_provider_record(&infrastructure_ref(), namespace, json!({ "spec": spec, "status": status }))
}

/// Fast timings for tests
pub fn test_settings() -> ReconcileSettings {
    ReconcileSettings {
        external_ready_wait: Duration::from_secs(30),
        delete_requeue: Duration::from_secs(10),
        reconcile_timeout: Duration::from_secs(5),
    }
}

/// Watch installer that records every install instead of talking to a cluster
#[derive(Debug, Default)]
pub struct RecordingInstaller {
    installs: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
    fail: AtomicBool,
    by_namespace: bool,
}

impl RecordingInstaller {
    /// Installer whose installs take `delay`, widening race windows in tests
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Installer keeping a separate watch per explicit reference namespace
    pub fn keyed_by_namespace() -> Self {
        Self {
            by_namespace: true,
            ..Default::default()
        }
    }

    /// Make subsequent installs fail
    pub fn fail_installs(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of installs performed for a kind key
    pub fn installs(&self, kind_key: &str) -> usize {
        self.installs.lock().unwrap().get(kind_key).copied().unwrap_or(0)
    }

    /// Total installs across all kinds
    pub fn total_installs(&self) -> usize {
        self.installs.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl WatchInstaller for RecordingInstaller {
    async fn install(&self, reference: &ObjectReference) -> Result<(), ControllerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ControllerError::Watch(format!("cannot watch {}", reference.kind_key())));
        }
        *self.installs.lock().unwrap().entry(self.watch_key(reference)).or_default() += 1;
        Ok(())
    }

    fn watch_key(&self, reference: &ObjectReference) -> String {
        match (&reference.namespace, self.by_namespace) {
            (Some(namespace), true) => format!("{}@{}", reference.kind_key(), namespace),
            _ => reference.kind_key(),
        }
    }
}

/// Reconciler over a mock store with a recording watch installer
pub fn create_test_reconciler(store: &MockObjectStore) -> (Reconciler, Arc<RecordingInstaller>) {
    let installer = Arc::new(RecordingInstaller::default());
    let watches = Arc::new(WatchRegistry::new(installer.clone()));
    let reconciler = Reconciler::new(Arc::new(store.clone()), watches, test_settings());
    (reconciler, installer)
}
