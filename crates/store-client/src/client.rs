//! Kube-backed object store
//!
//! Typed access for Machines and Clusters, and discovery-resolved dynamic
//! access for provider records whose kind is only known at runtime.

use crate::error::StoreError;
use crate::store_trait::ObjectStore;
use crds::{Cluster, Machine, ObjectReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{self, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Object store backed by a Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Resolved provider kinds ("group/version, Kind=X" -> resource)
    resources: Arc<Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>>,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Creates a store on top of an existing client.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Underlying kube client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Resolves the API resource for a reference's group/version/kind.
    ///
    /// Discovery results are cached for the lifetime of the store; provider
    /// kinds are installed once per cluster and rarely change.
    pub async fn resolve(&self, reference: &ObjectReference) -> Result<(ApiResource, ApiCapabilities), StoreError> {
        if reference.kind.is_empty() || reference.api_version.is_empty() {
            return Err(StoreError::InvalidReference(format!(
                "reference {:?} must set apiVersion and kind",
                reference.name
            )));
        }
        let key = reference.kind_key();
        if let Some(found) = self.cached(&key) {
            return Ok(found);
        }

        let (group, version) = reference.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &reference.kind);
        let resolved = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| match e {
                // Unknown group/version/kind
                kube::Error::Discovery(reason) => StoreError::InvalidReference(format!("{key}: {reason}")),
                other => StoreError::from_kube(other, &key),
            })
            .map_err(|e| match e {
                StoreError::NotFound(what) => {
                    StoreError::InvalidReference(format!("{what} is not served by the API server"))
                }
                other => other,
            })?;
        debug!("Resolved {} to resource {}", key, resolved.0.plural);

        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, resolved.clone());
        Ok(resolved)
    }

    fn cached(&self, key: &str) -> Option<(ApiResource, ApiCapabilities)> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn dynamic_api(&self, reference: &ObjectReference, namespace: &str) -> Result<Api<DynamicObject>, StoreError> {
        let (resource, caps) = self.resolve(reference).await?;
        Ok(match caps.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), reference.namespace_or(namespace), &resource),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Optional status fields left out of the serialized status when unset.
const CLEARABLE_STATUS_FIELDS: &[&str] = &["nodeRef", "providerID", "errorReason", "errorMessage", "message"];

/// Merge patch that writes the whole status of `machine`.
///
/// `resourceVersion` acts as a precondition on the write. Unset optional
/// fields are sent as `null`, otherwise the server keeps their old values.
pub fn status_patch(machine: &Machine) -> Result<Value, StoreError> {
    let mut status = serde_json::to_value(&machine.status)?;
    if let Value::Object(fields) = &mut status {
        for field in CLEARABLE_STATUS_FIELDS {
            fields.entry(*field).or_insert(Value::Null);
        }
    }
    Ok(json!({
        "metadata": { "resourceVersion": machine.metadata.resource_version },
        "status": status,
    }))
}

fn machine_key(machine: &Machine) -> Result<(String, String), StoreError> {
    let name = machine
        .metadata
        .name
        .clone()
        .ok_or_else(|| StoreError::InvalidReference("Machine missing name".to_string()))?;
    Ok((machine.namespace_or_default().to_string(), name))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError> {
        self.machines(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("Machine {namespace}/{name}")))
    }

    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let (namespace, name) = machine_key(machine)?;
        self.machines(&namespace)
            .replace(&name, &PostParams::default(), machine)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("Machine {namespace}/{name}")))
    }

    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError> {
        let (namespace, name) = machine_key(machine)?;
        let patch = status_patch(machine)?;
        self.machines(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("Machine {namespace}/{name} status")))
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        let api: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(e, &format!("Cluster {namespace}/{name}")))
    }

    async fn get_external(
        &self,
        reference: &ObjectReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, StoreError> {
        let api = self.dynamic_api(reference, namespace).await?;
        api.get_opt(&reference.name).await.map_err(|e| {
            StoreError::from_kube(e, &format!("{} {}/{}", reference.kind, reference.namespace_or(namespace), reference.name))
        })
    }

    async fn delete_external(&self, reference: &ObjectReference, namespace: &str) -> Result<(), StoreError> {
        let api = self.dynamic_api(reference, namespace).await?;
        match api.delete(&reference.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) => match StoreError::from_kube(
                e,
                &format!("{} {}/{}", reference.kind, reference.namespace_or(namespace), reference.name),
            ) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
