//! Error types for the Volume Pool Operator
//!
//! Provides structured error types for the event sources, the object stores and
//! the VolumePool reconciler, together with the requeue policy the dispatcher
//! applies to each of them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting write to {kind}/{name}: object has been modified")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Event Source Errors
    // =========================================================================
    #[error("Failed to start watch for {kind}: {reason}")]
    WatchSetup { kind: String, reason: String },

    #[error("Unknown watch event type {0:?}")]
    UnknownWatchEventType(String),

    #[error("Invalid handler registration")]
    InvalidHandlerRegistration,

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("{kind}/{name} exists but is not managed by this operator")]
    OwnershipConflict { kind: String, name: String },

    #[error("{kind}/{name} is not ready: {reason}")]
    DependencyNotReady {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Object is missing required field {0}")]
    MissingObjectKey(&'static str),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Label selector parse error: {0}")]
    SelectorParse(String),

    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::ResourceExists { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Waiting on the backend to catch up
            Error::DependencyNotReady { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Someone else owns the object; only a human can fix it
            Error::OwnershipConflict { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::InvalidHandlerRegistration
            | Error::SelectorParse(_)
            | Error::DurationParse(_)
            | Error::MissingObjectKey(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::DependencyNotReady { .. }
        )
    }

    /// Check if this error only means "try again later" and should not be
    /// reported at error level
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::DependencyNotReady { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DependencyNotReady {
            kind: "CephClient".into(),
            name: "c1--pool".into(),
            reason: "phase Progressing".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(5))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::OwnershipConflict {
            kind: "StorageClass".into(),
            name: "c1--pool".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Conflict {
            kind: "VolumePool".into(),
            name: "pool".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());

        assert!(!Error::InvalidHandlerRegistration.is_retryable());
    }

    #[test]
    fn test_not_ready_is_quiet() {
        let err = Error::DependencyNotReady {
            kind: "Secret".into(),
            name: "s".into(),
            reason: "missing key".into(),
        };
        assert!(err.is_not_ready());
        assert!(!Error::Internal("x".into()).is_not_ready());
    }
}
