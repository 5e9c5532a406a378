use stemflow_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Rejected at submission; no job record is created
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Results not ready for job {job_id} (status: {status})")]
    NotReady { job_id: String, status: String },

    #[error("Task queue closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn invalid_transition(from: impl std::fmt::Display, to: impl Into<String>) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.into(),
        }
    }

    /// Infrastructure failure of the job store; the operation may succeed later
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_store_failure())
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            OrchestratorError::JobNotFound(err.message)
        } else {
            OrchestratorError::Storage(err)
        }
    }
}

/// Failure category reported by stage adapters
///
/// The coordinator only translates the category into a state transition; it
/// never guesses retryability on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Retry with backoff while the stage retry budget lasts (timeout, OOM, network)
    Transient,
    /// Don't retry (corrupt or unsupported input)
    Fatal,
    /// Adapter observed the cancellation check and stopped
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display() {
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_not_found_maps_to_job_not_found() {
        let err: OrchestratorError = StorageError::job_not_found("abc").into();
        assert!(matches!(err, OrchestratorError::JobNotFound(_)));

        let err: OrchestratorError = StorageError::unavailable("db down").into();
        assert!(err.is_store_failure());

        let err = OrchestratorError::invalid_transition("queued", "completed");
        assert!(!err.is_store_failure());
    }
}
