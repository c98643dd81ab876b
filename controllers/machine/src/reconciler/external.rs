//! External reference reconciliation.
//!
//! Reads a bootstrap or infrastructure provider record through the untyped
//! accessor and folds what it reports into the Machine. Provider records are
//! never written here; they belong to their provider controllers.

use crate::error::ControllerError;
use crds::{INVALID_CONFIGURATION_MACHINE_ERROR, Machine, MachineAddress, ObjectReference};
use serde_json::Value;
use store_client::{DynamicObject, ObjectStore, nested_bool, nested_slice_of_maps, nested_string};
use tracing::{debug, info, warn};

/// Which of the machine's provider references to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// `spec.bootstrap.configRef`
    Bootstrap,
    /// `spec.infrastructureRef`
    Infrastructure,
}

impl std::fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceKind::Bootstrap => f.write_str("bootstrap"),
            ReferenceKind::Infrastructure => f.write_str("infrastructure"),
        }
    }
}

/// Result of reconciling one provider reference.
///
/// Invalid provider state and lost infrastructure are reported as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceOutcome {
    /// Provider is ready and its data has been copied onto the machine
    Ready,
    /// Provider exists but does not report `status.ready`
    NotReady,
    /// Provider record does not exist (yet)
    NotFound,
}

impl ReferenceOutcome {
    /// Outcomes that call for a fixed-interval requeue.
    pub fn needs_requeue(self) -> bool {
        !matches!(self, ReferenceOutcome::Ready)
    }
}

/// Reconcile one provider reference of `machine`.
///
/// Readiness flags are only ever raised here, never lowered.
///
/// # Errors
///
/// - `InvalidConfig` if the machine has neither a bootstrap reference nor inline data
/// - `InvalidState` if a ready bootstrap provider has no `status.bootstrapData`
/// - `InfrastructureLost` if the infrastructure record vanished under a running machine
/// - store and field errors are propagated unchanged
pub async fn reconcile_reference(
    store: &dyn ObjectStore,
    machine: &mut Machine,
    kind: ReferenceKind,
) -> Result<ReferenceOutcome, ControllerError> {
    let reference = match kind {
        ReferenceKind::Bootstrap => match machine.spec.bootstrap.config_ref.clone() {
            Some(reference) => reference,
            None => return inline_bootstrap(machine),
        },
        ReferenceKind::Infrastructure => machine.spec.infrastructure_ref.clone(),
    };

    let namespace = machine.namespace_or_default().to_string();
    let Some(record) = store.get_external(&reference, &namespace).await? else {
        return provider_missing(machine, kind, &reference);
    };

    copy_provider_failure(machine, &record)?;

    let ready = nested_bool(&record.data, &["status", "ready"])?.unwrap_or(false);
    match kind {
        ReferenceKind::Bootstrap => reconcile_bootstrap(machine, &record, &reference, ready),
        ReferenceKind::Infrastructure => reconcile_infrastructure(machine, &record, &reference, ready),
    }
}

/// Bootstrap data has been delivered to the machine. An empty payload counts as absent.
fn has_bootstrap_data(machine: &Machine) -> bool {
    machine.spec.bootstrap.data.as_deref().is_some_and(|data| !data.is_empty())
}

fn inline_bootstrap(machine: &mut Machine) -> Result<ReferenceOutcome, ControllerError> {
    if !has_bootstrap_data(machine) {
        return Err(ControllerError::InvalidConfig(format!(
            "Machine {}/{} sets neither spec.bootstrap.configRef nor spec.bootstrap.data",
            machine.namespace_or_default(),
            machine.name_or_empty()
        )));
    }
    machine.status_mut().bootstrap_ready = true;
    Ok(ReferenceOutcome::Ready)
}

fn provider_missing(
    machine: &mut Machine,
    kind: ReferenceKind,
    reference: &ObjectReference,
) -> Result<ReferenceOutcome, ControllerError> {
    let key = format!("{}/{}", machine.namespace_or_default(), machine.name_or_empty());

    match kind {
        ReferenceKind::Infrastructure => {
            let status = machine.status_mut();
            if status.infrastructure_ready && status.node_ref.is_some() {
                let message = format!(
                    "Machine {} infrastructure {} {:?} was deleted after it became ready",
                    key, reference.kind, reference.name
                );
                warn!("{}", message);
                status.error_reason = Some(INVALID_CONFIGURATION_MACHINE_ERROR.to_string());
                status.error_message = Some(message.clone());
                return Err(ControllerError::InfrastructureLost(message));
            }
        }
        ReferenceKind::Bootstrap => {
            // Delivered bootstrap data is final; the config may be garbage collected afterwards.
            if has_bootstrap_data(machine) {
                machine.status_mut().bootstrap_ready = true;
                return Ok(ReferenceOutcome::Ready);
            }
        }
    }

    debug!("Machine {} {} provider {} {:?} not found", key, kind, reference.kind, reference.name);
    Ok(ReferenceOutcome::NotFound)
}

fn copy_provider_failure(machine: &mut Machine, record: &DynamicObject) -> Result<(), ControllerError> {
    let reason = nested_string(&record.data, &["status", "errorReason"])?.filter(|s| !s.is_empty());
    let message = nested_string(&record.data, &["status", "errorMessage"])?.filter(|s| !s.is_empty());
    if reason.is_none() && message.is_none() {
        return Ok(());
    }

    let status = machine.status_mut();
    if reason.is_some() {
        status.error_reason = reason;
    }
    if message.is_some() {
        status.error_message = message;
    }
    Ok(())
}

fn reconcile_bootstrap(
    machine: &mut Machine,
    record: &DynamicObject,
    reference: &ObjectReference,
    ready: bool,
) -> Result<ReferenceOutcome, ControllerError> {
    if has_bootstrap_data(machine) {
        machine.status_mut().bootstrap_ready = true;
        return Ok(ReferenceOutcome::Ready);
    }
    if !ready {
        return Ok(ReferenceOutcome::NotReady);
    }

    let data = nested_string(&record.data, &["status", "bootstrapData"])?
        .filter(|data| !data.is_empty())
        .ok_or_else(|| {
            ControllerError::InvalidState(format!(
                "bootstrap provider {} {:?} reports ready but has no status.bootstrapData",
                reference.kind, reference.name
            ))
        })?;

    info!(
        "Copied bootstrap data from {} {:?} to Machine {}/{}",
        reference.kind,
        reference.name,
        machine.namespace_or_default(),
        machine.name_or_empty()
    );
    machine.spec.bootstrap.data = Some(data);
    machine.status_mut().bootstrap_ready = true;
    Ok(ReferenceOutcome::Ready)
}

fn reconcile_infrastructure(
    machine: &mut Machine,
    record: &DynamicObject,
    reference: &ObjectReference,
    ready: bool,
) -> Result<ReferenceOutcome, ControllerError> {
    if !ready {
        return Ok(ReferenceOutcome::NotReady);
    }

    let provider_id = nested_string(&record.data, &["spec", "providerID"])?;
    let addresses = nested_slice_of_maps(&record.data, &["status", "addresses"])?
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let address_type = entry.get("type").and_then(Value::as_str);
            let address = entry.get("address").and_then(Value::as_str);
            match (address_type, address) {
                (Some(address_type), Some(address)) => Some(MachineAddress {
                    address_type: address_type.to_string(),
                    address: address.to_string(),
                }),
                _ => {
                    warn!(
                        "Skipping address {} of {} {:?}: type and address must both be strings",
                        serde_json::Value::Object(entry.clone()),
                        reference.kind,
                        reference.name
                    );
                    None
                }
            }
        })
        .collect();

    let status = machine.status_mut();
    if !status.infrastructure_ready {
        info!("Infrastructure {} {:?} is ready", reference.kind, reference.name);
    }
    if provider_id.is_some() {
        status.provider_id = provider_id;
    }
    status.addresses = addresses;
    status.infrastructure_ready = true;
    Ok(ReferenceOutcome::Ready)
}

#[cfg(test)]
#[path = "external_test.rs"]
mod tests;
