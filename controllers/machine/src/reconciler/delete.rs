//! Deletion of a machine's provider records.
//!
//! The finalizer is removed by the caller, and only after this reports that
//! every referenced record is gone.

use crate::error::ControllerError;
use crate::reconcile_helpers::external_references;
use crds::Machine;
use store_client::{ObjectStore, StoreError};
use tracing::{debug, info, warn};

/// Delete whichever provider records of `machine` still exist.
///
/// Returns `true` when none of them exist any more, `false` when at least one
/// delete was issued on this pass.
///
/// # Errors
///
/// Propagates store errors other than the referenced kind not being served.
pub async fn reconcile_delete(store: &dyn ObjectStore, machine: &Machine) -> Result<bool, ControllerError> {
    let namespace = machine.namespace_or_default();
    let mut all_gone = true;

    for reference in external_references(machine) {
        let exists = match store.get_external(&reference, namespace).await {
            Ok(record) => record.is_some(),
            // A kind the API server no longer serves cannot have instances left
            Err(StoreError::InvalidReference(reason)) => {
                warn!("Treating {} {:?} as deleted: {}", reference.kind, reference.name, reason);
                false
            }
            Err(e) => return Err(e.into()),
        };
        if !exists {
            debug!("{} {:?} already gone", reference.kind, reference.name);
            continue;
        }

        info!(
            "Deleting {} {:?} for Machine {}/{}",
            reference.kind,
            reference.name,
            namespace,
            machine.name_or_empty()
        );
        store.delete_external(&reference, namespace).await?;
        all_gone = false;
    }

    Ok(all_gone)
}
