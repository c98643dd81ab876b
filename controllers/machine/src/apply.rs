//! Apply-and-wait for provider component bundles.
//!
//! A bundle is a multi-document YAML file (CRDs, RBAC, provider deployments).
//! Applying it can fail transiently, e.g. a custom resource whose CRD is not
//! established yet, so it is retried on a fixed interval until it goes
//! through or the timeout expires.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::ObjectReference;
use kube::Api;
use kube::api::{DynamicObject, Patch, PatchParams};
use kube::discovery::Scope;
use serde::Deserialize;
use std::time::Duration;
use store_client::KubeStore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "machine-controller";

/// Applies a manifest bundle to a target system.
#[async_trait]
pub trait ComponentApplier: Send + Sync {
    /// Apply every object in `bundle`.
    async fn apply(&self, bundle: &str) -> Result<(), ControllerError>;
}

/// Server-side applies bundles to the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeApplier {
    store: KubeStore,
}

impl KubeApplier {
    /// Applier resolving kinds through `store`'s discovery cache.
    pub fn new(store: KubeStore) -> Self {
        Self { store }
    }
}

/// Split a multi-document YAML bundle into objects, skipping empty documents.
///
/// # Errors
///
/// Returns `ControllerError::Apply` for malformed YAML or documents without
/// `apiVersion`/`kind`/`metadata.name`.
pub fn parse_bundle(bundle: &str) -> Result<Vec<DynamicObject>, ControllerError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(bundle) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ControllerError::Apply(format!("invalid YAML document: {e}")))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| ControllerError::Apply(format!("invalid object: {e}")))?;
        if object.types.is_none() || object.metadata.name.is_none() {
            return Err(ControllerError::Apply(
                "every object needs apiVersion, kind and metadata.name".to_string(),
            ));
        }
        objects.push(object);
    }
    Ok(objects)
}

#[async_trait]
impl ComponentApplier for KubeApplier {
    async fn apply(&self, bundle: &str) -> Result<(), ControllerError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();

        for object in parse_bundle(bundle)? {
            let (api_version, kind) = object
                .types
                .as_ref()
                .map(|t| (t.api_version.clone(), t.kind.clone()))
                .unwrap_or_default();
            let name = object.metadata.name.clone().unwrap_or_default();
            let reference = ObjectReference::new(api_version, kind, name.clone());

            let (resource, capabilities) = self.store.resolve(&reference).await?;
            let client = self.store.client().clone();
            let api: Api<DynamicObject> = match capabilities.scope {
                Scope::Namespaced => {
                    let namespace = object.metadata.namespace.as_deref().unwrap_or("default");
                    Api::namespaced_with(client, namespace, &resource)
                }
                Scope::Cluster => Api::all_with(client, &resource),
            };

            api.patch(&name, &params, &Patch::Apply(&object)).await?;
            debug!("Applied {} {}", reference.kind, name);
        }
        Ok(())
    }
}

/// Apply `bundle` immediately and then every `interval` until it succeeds or
/// `timeout` elapses.
///
/// # Errors
///
/// Returns `ControllerError::Apply` carrying the last apply error on timeout.
pub async fn apply_until_ready(
    applier: &dyn ComponentApplier,
    bundle: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), ControllerError> {
    info!("Applying provider components (timeout {:?})", timeout);
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let error = match tokio::time::timeout(remaining, applier.apply(bundle)).await {
            Ok(Ok(())) => {
                info!("Provider components applied after {} attempt(s)", attempts);
                return Ok(());
            }
            Ok(Err(e)) => e.to_string(),
            Err(_elapsed) => "apply did not finish before the deadline".to_string(),
        };

        if Instant::now() + interval > deadline {
            return Err(ControllerError::Apply(format!(
                "components not ready after {attempts} attempt(s): {error}"
            )));
        }
        warn!("Applying components failed (attempt {}): {}", attempts, error);
        tokio::time::sleep(interval).await;
    }
}
