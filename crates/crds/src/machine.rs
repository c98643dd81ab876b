//! Machine CRD
//!
//! A single unit of compute in a cluster. Provisioning is delegated to a
//! bootstrap provider and an infrastructure provider referenced by the spec.

use crate::references::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer token placed on every Machine by the machine controller.
pub const MACHINE_FINALIZER: &str = "machine.cluster.x-k8s.io";

/// Error reason recorded when the machine configuration can no longer be satisfied
/// (e.g., its infrastructure vanished after being ready).
pub const INVALID_CONFIGURATION_MACHINE_ERROR: &str = "InvalidConfiguration";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerID"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the Cluster this machine belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Bootstrap configuration (provider reference and/or inline data)
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Reference to the infrastructure provider record
    pub infrastructure_ref: ObjectReference,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Reference to the bootstrap provider record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Bootstrap payload. Copied from the provider once and never overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Reference to the Node backed by this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Provider-specific machine identifier copied from the infrastructure provider
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Addresses reported by the infrastructure provider, in provider order
    #[serde(default)]
    pub addresses: Vec<MachineAddress>,

    /// Bootstrap provider reported ready and bootstrap data is available
    #[serde(default)]
    pub bootstrap_ready: bool,

    /// Infrastructure provider reported ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// Derived lifecycle phase
    #[serde(default)]
    pub phase: MachinePhase,

    /// Terminal failure reason. Once set the machine stays `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human-readable detail for `error_reason`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Diagnostic for the most recent recoverable problem (cleared on a clean pass)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MachineStatus {
    /// True when a terminal failure has been recorded.
    pub fn has_failure(&self) -> bool {
        self.error_reason.as_deref().is_some_and(|s| !s.is_empty())
            || self.error_message.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Address of a machine as reported by its infrastructure provider.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type (e.g., "InternalIP", "ExternalDNS")
    #[serde(rename = "type")]
    pub address_type: String,

    /// The address itself
    pub address: String,
}

/// Machine lifecycle phase
///
/// Serializes as PascalCase ("Pending", "Running", etc.) and accepts
/// lowercase on input.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "PascalCase")]
pub enum MachinePhase {
    /// Bootstrap not ready yet
    #[default]
    #[serde(alias = "pending")]
    Pending,

    /// Bootstrap ready, infrastructure still provisioning
    #[serde(alias = "provisioning")]
    Provisioning,

    /// Bootstrap and infrastructure ready, no Node yet
    #[serde(alias = "provisioned")]
    Provisioned,

    /// Backing Node is registered
    #[serde(alias = "running")]
    Running,

    /// Deletion requested, external resources being torn down
    #[serde(alias = "deleting")]
    Deleting,

    /// Terminal failure recorded
    #[serde(alias = "failed")]
    Failed,
}

impl MachinePhase {
    /// PascalCase label as stored in `status.phase`.
    pub fn as_str(self) -> &'static str {
        match self {
            MachinePhase::Pending => "Pending",
            MachinePhase::Provisioning => "Provisioning",
            MachinePhase::Provisioned => "Provisioned",
            MachinePhase::Running => "Running",
            MachinePhase::Deleting => "Deleting",
            MachinePhase::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Machine {
    /// True once a deletion timestamp has been set.
    pub fn being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Status block, created empty if the machine has never been reconciled.
    pub fn status_mut(&mut self) -> &mut MachineStatus {
        self.status.get_or_insert_with(MachineStatus::default)
    }

    /// Namespace of the machine (`default` when unset).
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Name of the machine (empty when unset).
    pub fn name_or_empty(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
