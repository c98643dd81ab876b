//! Phase derivation.
//!
//! The phase is a pure function of the machine's status and whether deletion
//! has been requested; it is recomputed on every pass and never stored as an
//! input to anything else.

use crds::{MachinePhase, MachineStatus};

/// Derive the lifecycle phase from status flags.
///
/// Precedence, first match wins:
/// 1. deletion requested: `Deleting`
/// 2. terminal failure recorded: `Failed`
/// 3. bootstrap not ready: `Pending`
/// 4. infrastructure not ready: `Provisioning`
/// 5. no Node yet: `Provisioned`
/// 6. otherwise `Running`
pub fn compute_phase(status: &MachineStatus, being_deleted: bool) -> MachinePhase {
    if being_deleted {
        return MachinePhase::Deleting;
    }
    if status.has_failure() {
        return MachinePhase::Failed;
    }
    match (status.bootstrap_ready, status.infrastructure_ready, status.node_ref.is_some()) {
        (false, _, _) => MachinePhase::Pending,
        (true, false, _) => MachinePhase::Provisioning,
        (true, true, false) => MachinePhase::Provisioned,
        (true, true, true) => MachinePhase::Running,
    }
}
