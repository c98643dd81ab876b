//! Cluster CRD
//!
//! Only the identity of a Cluster is consumed by the machine controller: it is
//! the owner attached to Machines that declare a `clusterName`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Cluster",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Whether reconciliation of this cluster is paused
    #[serde(default)]
    pub paused: bool,
}
