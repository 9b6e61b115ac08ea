//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency conflict on a write
    #[error("conflict: {0}")]
    Conflict(String),

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Operator configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error in a resource or document
    #[error("Validation error: {0}")]
    Validation(String),

    /// The upgrade patch document could not be loaded or applied
    #[error("Upgrade patch error: {0}")]
    UpgradePatch(String),

    /// A version string or range could not be parsed
    #[error("Version error: {0}")]
    Version(String),

    /// A JSON patch failed to apply
    #[error("JSON patch error: {0}")]
    JsonPatch(#[from] json_patch::PatchError),

    /// A subordinate resource could not be reconciled
    #[error("Operand error: {0}")]
    Operand(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Conflict(_) | Error::Operand(_) | Error::Io(_) => true,
            Error::Version(_) | Error::UpgradePatch(_) | Error::JsonPatch(_) => true,
            Error::Validation(_) | Error::MissingField(_) | Error::Config(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_conflict() {
            Duration::from_millis(100)
        } else if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(3600)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a reconcile cycle.
///
/// A cycle may fail and still ask to be requeued; conflicts always do.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ReconcileError {
    pub source: Error,
    pub requeue: bool,
}

impl ReconcileError {
    /// Wrap an error, requeueing only if it is a conflict.
    pub fn new(source: Error) -> Self {
        let requeue = source.is_conflict();
        Self { source, requeue }
    }

    /// Wrap an error and always requeue.
    pub fn requeue(source: Error) -> Self {
        Self {
            source,
            requeue: true,
        }
    }

    /// Wrap an error with an explicit requeue flag. Conflicts still requeue.
    pub fn with_requeue(source: Error, requeue: bool) -> Self {
        let requeue = requeue || source.is_conflict();
        Self { source, requeue }
    }
}

impl From<Error> for ReconcileError {
    fn from(source: Error) -> Self {
        Self::new(source)
    }
}
