//! Helper functions for common reconciliation patterns
//!
//! Finalizer bookkeeping, owner-reference checks and requeue arithmetic
//! shared by the normal and deletion paths of the Machine reconciler.

use crds::{Machine, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

/// True if `finalizer` is present in the object's finalizer list.
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Append `finalizer` if missing. Returns `true` when the list changed.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers.get_or_insert_with(Vec::new).push(finalizer.to_string());
    true
}

/// Remove every occurrence of `finalizer`, keeping all other tokens in order.
/// Returns `true` when the list changed.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

/// True if the object already has at least one owner reference.
pub fn has_owner_references(meta: &ObjectMeta) -> bool {
    meta.owner_references.as_ref().is_some_and(|owners| !owners.is_empty())
}

/// Provider records referenced by a machine: the bootstrap config (when one is
/// referenced) followed by the infrastructure record.
pub fn external_references(machine: &Machine) -> Vec<ObjectReference> {
    machine
        .spec
        .bootstrap
        .config_ref
        .iter()
        .chain(std::iter::once(&machine.spec.infrastructure_ref))
        .cloned()
        .collect()
}

/// Combine two requeue requests, keeping the sooner one.
pub fn sooner(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
#[path = "reconcile_helpers_test.rs"]
mod tests;
