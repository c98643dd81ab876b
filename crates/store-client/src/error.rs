//! Object store errors

use thiserror::Error;

/// Errors that can occur when talking to the object store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Kubernetes API error not covered by a more specific variant
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency check failed (stale resourceVersion)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store could not be reached or timed out
    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reference cannot be resolved to an API resource (missing kind, unknown group/version)
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
}

impl StoreError {
    /// Classifies a kube client error, pulling out not-found and conflict responses.
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound(what.to_string()),
            kube::Error::Api(resp) if resp.code == 409 => {
                StoreError::Conflict(format!("{}: {}", what, resp.message))
            }
            _ => StoreError::Kube(err),
        }
    }

    /// True for errors that are expected to clear on their own and should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Unavailable(_) => true,
            StoreError::Kube(kube::Error::Api(resp)) => resp.code == 429 || resp.code >= 500,
            StoreError::Kube(_) => true,
            StoreError::NotFound(_) | StoreError::Serialization(_) | StoreError::InvalidReference(_) => false,
        }
    }
}
