//! Controller-specific error types.
//!
//! This module defines error types specific to the Machine Controller
//! that are not covered by upstream library errors.

use std::time::Duration;
use store_client::{FieldError, StoreError};
use thiserror::Error;

/// Errors that can occur in the Machine Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object store error (includes optimistic concurrency conflicts)
    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    /// Provider record field has an unexpected type
    #[error("Provider field error: {0}")]
    Field(#[from] FieldError),

    /// Invalid configuration (controller settings or Machine spec)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Provider claims readiness without the data it must deliver
    #[error("Invalid provider state: {0}")]
    InvalidState(String),

    /// Infrastructure record disappeared under a running machine
    #[error("Infrastructure lost: {0}")]
    InfrastructureLost(String),

    /// Provider watch could not be established
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Reconciliation pass exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// Applying provider components failed
    #[error("Applying components failed: {0}")]
    Apply(String),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error (probe listener, component bundle)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// Errors worth surfacing on the Machine as a diagnostic (`status.message`).
    ///
    /// Transient store failures are retried silently; terminal failures are
    /// recorded through `errorReason`/`errorMessage` instead.
    pub fn is_diagnostic(&self) -> bool {
        matches!(
            self,
            ControllerError::InvalidState(_)
                | ControllerError::InvalidConfig(_)
                | ControllerError::Field(_)
                | ControllerError::Store(StoreError::InvalidReference(_))
        )
    }

    /// Errors expected to clear without any change to the Machine.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Store(e) => e.is_transient(),
            ControllerError::Kube(_) | ControllerError::Watch(_) | ControllerError::Timeout(_) => true,
            _ => false,
        }
    }
}
