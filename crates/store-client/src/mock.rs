//! Mock ObjectStore for unit testing
//!
//! This module provides an in-memory implementation of `ObjectStore` that can
//! be used in unit tests without a running API server. It mimics the parts of
//! API server behaviour the machine controller relies on:
//! - generated UIDs and increasing resourceVersions
//! - conflicts on writes carrying a stale resourceVersion
//! - status writes that do not touch spec, spec writes that do not touch status
//! - status writes applied with JSON merge-patch rules, as `KubeStore` sends them
//! - physical removal of a deleting object once its finalizer list is empty

use crate::client::status_patch;
use crate::error::StoreError;
use crate::store_trait::ObjectStore;
use crate::unstructured::{FieldError, set_nested_field};
use chrono::{SecondsFormat, Utc};
use crds::{Cluster, Machine, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::DynamicObject;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// (apiVersion, kind, namespace, name) of a provider record
pub type ExternalKey = (String, String, String, String);

type ObjectKey = (String, String);

/// Mock ObjectStore for testing
///
/// Clones share the same underlying storage, so a test can hand one clone to
/// the reconciler and inspect the results through another.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    machines: Arc<Mutex<HashMap<ObjectKey, Machine>>>,
    clusters: Arc<Mutex<HashMap<ObjectKey, Cluster>>>,
    externals: Arc<Mutex<HashMap<ExternalKey, DynamicObject>>>,
    // Every delete_external call, in order
    delete_calls: Arc<Mutex<Vec<ExternalKey>>>,
    external_reads_fail: Arc<AtomicBool>,
    resource_version: Arc<AtomicU64>,
}

impl std::fmt::Debug for MockObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockObjectStore").finish_non_exhaustive()
    }
}

fn meta_key(meta: &ObjectMeta) -> ObjectKey {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

fn reference_key(reference: &ObjectReference, namespace: &str) -> ExternalKey {
    (
        reference.api_version.clone(),
        reference.kind.clone(),
        reference.namespace_or(namespace).to_string(),
        reference.name.clone(),
    )
}

fn record_key(record: &DynamicObject) -> ExternalKey {
    let (api_version, kind) = record
        .types
        .as_ref()
        .map(|t| (t.api_version.clone(), t.kind.clone()))
        .unwrap_or_default();
    let (namespace, name) = meta_key(&record.metadata);
    (api_version, kind, namespace, name)
}

/// Applies a JSON merge patch (RFC 7386) to `target`.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in entries {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Current time as a Kubernetes `Time`.
pub fn now() -> Option<Time> {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(stamp)).ok()
}

impl MockObjectStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        if meta.namespace.is_none() {
            meta.namespace = Some("default".to_string());
        }
        meta.resource_version = Some(self.next_version());
    }

    /// Add a machine to the mock store (for test setup). Returns the stored copy.
    pub fn add_machine(&self, mut machine: Machine) -> Machine {
        self.stamp(&mut machine.metadata);
        self.machines
            .lock()
            .unwrap()
            .insert(meta_key(&machine.metadata), machine.clone());
        machine
    }

    /// Add a cluster to the mock store (for test setup). Returns the stored copy.
    pub fn add_cluster(&self, mut cluster: Cluster) -> Cluster {
        self.stamp(&mut cluster.metadata);
        self.clusters
            .lock()
            .unwrap()
            .insert(meta_key(&cluster.metadata), cluster.clone());
        cluster
    }

    /// Add a provider record to the mock store (for test setup)
    pub fn add_external(&self, mut record: DynamicObject) {
        self.stamp(&mut record.metadata);
        self.externals.lock().unwrap().insert(record_key(&record), record);
    }

    /// Remove a provider record out-of-band (simulates another actor deleting it)
    pub fn remove_external(&self, reference: &ObjectReference, namespace: &str) -> Option<DynamicObject> {
        self.externals
            .lock()
            .unwrap()
            .remove(&reference_key(reference, namespace))
    }

    /// Set a field on a stored provider record (simulates the provider controller)
    pub fn set_external_field(
        &self,
        reference: &ObjectReference,
        namespace: &str,
        path: &[&str],
        value: serde_json::Value,
    ) -> Result<(), FieldError> {
        let mut externals = self.externals.lock().unwrap();
        if let Some(record) = externals.get_mut(&reference_key(reference, namespace)) {
            set_nested_field(&mut record.data, path, value)?;
        }
        Ok(())
    }

    /// Whether a provider record is currently stored
    pub fn has_external(&self, reference: &ObjectReference, namespace: &str) -> bool {
        self.externals
            .lock()
            .unwrap()
            .contains_key(&reference_key(reference, namespace))
    }

    /// Current stored copy of a machine
    pub fn machine(&self, namespace: &str, name: &str) -> Option<Machine> {
        self.machines
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mark a machine for deletion. Without finalizers it is removed immediately.
    pub fn request_machine_deletion(&self, namespace: &str, name: &str) {
        let mut machines = self.machines.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(machine) = machines.get_mut(&key) else {
            return;
        };
        if machine.metadata.finalizers.as_ref().is_none_or(Vec::is_empty) {
            machines.remove(&key);
            return;
        }
        if machine.metadata.deletion_timestamp.is_none() {
            machine.metadata.deletion_timestamp = now();
        }
        machine.metadata.resource_version = Some(self.next_version());
    }

    /// All delete_external calls made so far
    pub fn delete_calls(&self) -> Vec<ExternalKey> {
        self.delete_calls.lock().unwrap().clone()
    }

    /// Make every external read fail with `StoreError::Unavailable`
    pub fn fail_external_reads(&self, fail: bool) {
        self.external_reads_fail.store(fail, Ordering::SeqCst);
    }

    fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, what: &str) -> Result<(), StoreError> {
        match &incoming.resource_version {
            Some(version) if stored.resource_version.as_ref() != Some(version) => Err(StoreError::Conflict(
                format!("{what}: resourceVersion {version} is stale"),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for MockObjectStore {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self.machine(namespace, name))
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let key = meta_key(&machine.metadata);
        let what = format!("Machine {}/{}", key.0, key.1);
        let mut machines = self.machines.lock().unwrap();
        let stored = machines
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        Self::check_version(&stored.metadata, &machine.metadata, &what)?;

        let mut metadata = machine.metadata.clone();
        // Server-owned fields cannot be changed through an update
        metadata.uid = stored.metadata.uid.clone();
        metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        metadata.resource_version = Some(self.next_version());
        stored.metadata = metadata;
        stored.spec = machine.spec.clone();

        let updated = stored.clone();
        let finalized = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if finalized {
            machines.remove(&key);
        }
        Ok(updated)
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let key = meta_key(&machine.metadata);
        let what = format!("Machine {}/{} status", key.0, key.1);
        let mut machines = self.machines.lock().unwrap();
        let stored = machines
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(what.clone()))?;
        Self::check_version(&stored.metadata, &machine.metadata, &what)?;

        let patch = status_patch(machine)?;
        let mut status = serde_json::to_value(&stored.status)?;
        merge_patch(&mut status, &patch["status"]);
        stored.status = serde_json::from_value(status)?;
        stored.metadata.resource_version = Some(self.next_version());
        Ok(stored.clone())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_external(
        &self,
        reference: &ObjectReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        if self.external_reads_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} {}", reference.kind, reference.name)));
        }
        Ok(self
            .externals
            .lock()
            .unwrap()
            .get(&reference_key(reference, namespace))
            .cloned())
    }

    async fn delete_external(&self, reference: &ObjectReference, namespace: &str) -> Result<(), StoreError> {
        let key = reference_key(reference, namespace);
        self.delete_calls.lock().unwrap().push(key.clone());
        self.externals.lock().unwrap().remove(&key);
        Ok(())
    }
}
