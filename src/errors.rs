//! Typed error hierarchy for the execution engine.
//!
//! `EngineError` is the single error type returned across manager seams.
//! Internals keep using `anyhow` with context and convert at the boundary.
//! The variants follow the propagation policy of the engine:
//! - validation / not-found errors are raised before any side effect
//! - process / git / filesystem errors abort execution setup
//! - sync conflicts are normally captured per ref rather than raised
//! - resource exhaustion covers ports and admission denial

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("Execution {id} not found")]
    ExecutionNotFound { id: String },

    #[error("Ref {id} not found")]
    RefNotFound { id: String },

    #[error("Process error for execution {execution_id}: {message}")]
    Process {
        execution_id: String,
        message: String,
    },

    #[error("Git error on ref {ref_id}: {message}")]
    Git { ref_id: String, message: String },

    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sync conflict on ref {ref_id}: {message}")]
    SyncConflict { ref_id: String, message: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Admission denied: {reason}")]
    AdmissionDenied { reason: String },

    #[error("Invalid status transition for execution {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Execution {id} is still {status}")]
    ExecutionActive { id: String, status: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn git(ref_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Git {
            ref_id: ref_id.to_string(),
            message: format!("{:#}", err),
        }
    }

    /// Validation and not-found errors are caller mistakes and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::ExecutionNotFound { .. } | Self::RefNotFound { .. }
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_field_and_message() {
        let err = EngineError::validation("execution_id", "must not be empty");
        match &err {
            EngineError::Validation { field, message } => {
                assert_eq!(*field, "execution_id");
                assert_eq!(message, "must not be empty");
            }
            _ => panic!("Expected Validation"),
        }
        assert!(err.to_string().contains("execution_id"));
    }

    #[test]
    fn filesystem_error_keeps_io_source() {
        use std::error::Error as _;
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = EngineError::Filesystem {
            path: std::path::PathBuf::from("/work/e1"),
            source: io_err,
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("/work/e1"));
    }

    #[test]
    fn caller_errors_are_classified() {
        assert!(EngineError::ExecutionNotFound { id: "e1".into() }.is_caller_error());
        assert!(EngineError::RefNotFound { id: "r1".into() }.is_caller_error());
        assert!(!EngineError::ResourceExhausted("no available ports".into()).is_caller_error());
        assert!(
            !EngineError::AdmissionDenied {
                reason: "too many".into()
            }
            .is_caller_error()
        );
    }

    #[test]
    fn anyhow_converts_into_other() {
        let err: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, EngineError::Other(_)));
    }

    #[test]
    fn git_helper_formats_chain() {
        let inner = anyhow::anyhow!("reference not found").context("Failed to open branch");
        let err = EngineError::git("r1", inner);
        let text = err.to_string();
        assert!(text.contains("r1"));
        assert!(text.contains("reference not found"));
    }
}
