//! Kubernetes object references for Machine CRDs
//!
//! Provides the `ObjectReference` used by a Machine to point at its bootstrap
//! and infrastructure providers, and at the Node it eventually backs.
//! Follows the Kubernetes `ObjectReference` pattern with apiVersion, kind, name
//! and optional namespace/uid.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another Kubernetes object, possibly of a kind unknown at compile time.
///
/// - `apiVersion`: group/version of the referenced resource (e.g., "bootstrap.cluster.x-k8s.io/v1alpha3")
/// - `kind`: kind of the referenced resource (e.g., "KubeadmConfig")
/// - `name`: name of the referenced resource (required)
/// - `namespace`: namespace of the referenced resource (defaults to the Machine's namespace)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// API version of the referenced resource
    #[serde(default)]
    pub api_version: String,

    /// Kind of the referenced resource
    #[serde(default)]
    pub kind: String,

    /// Name of the referenced resource
    pub name: String,

    /// Namespace of the referenced resource (defaults to same namespace as the referencing resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// UID of the referenced resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectReference {
    /// Create a new reference with apiVersion, kind, and name (same namespace)
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            uid: None,
        }
    }

    /// Namespace to look the referenced object up in.
    ///
    /// Falls back to the referencing object's namespace when none is recorded.
    pub fn namespace_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }

    /// Splits `apiVersion` into (group, version). The core group is the empty string.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Stable identifier of the referenced resource kind, e.g.
    /// `infrastructure.cluster.x-k8s.io/v1alpha3, Kind=AWSMachine`.
    pub fn kind_key(&self) -> String {
        format!("{}, Kind={}", self.api_version, self.kind)
    }
}
