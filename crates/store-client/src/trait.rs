//! ObjectStore trait for mocking
//!
//! This trait abstracts the object store (the Kubernetes API server) so the
//! machine reconciler can be exercised in unit tests against an in-memory
//! implementation. The kube-backed `KubeStore` implements it for production.

use crate::error::StoreError;
use crds::{Cluster, Machine, ObjectReference};
use kube::core::DynamicObject;

/// Operations the machine controller needs from the object store
///
/// Gets return `Ok(None)` when the object does not exist. Updates are guarded
/// by the `resourceVersion` carried in the object's metadata and fail with
/// `StoreError::Conflict` when it is stale.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a Machine by namespace/name.
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError>;

    /// Persist metadata and spec of a Machine. Status is left untouched.
    async fn update_machine(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Persist only the status of a Machine.
    async fn update_machine_status(&self, machine: &Machine) -> Result<Machine, StoreError>;

    /// Fetch a Cluster by namespace/name.
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError>;

    /// Fetch the untyped provider record a reference points at.
    ///
    /// `namespace` is used when the reference does not carry one.
    async fn get_external(
        &self,
        reference: &ObjectReference,
        namespace: &str,
    ) -> Result<Option<DynamicObject>, StoreError>;

    /// Delete the provider record a reference points at. Deleting a record that
    /// does not exist is not an error.
    async fn delete_external(&self, reference: &ObjectReference, namespace: &str) -> Result<(), StoreError>;
}
