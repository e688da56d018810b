//! Error handling for the orchestration layer.

use hpcflow_remote::RemoteError;
use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur while staging, submitting or tracking a run.
#[derive(Error, Debug)]
pub enum SchedError {
    /// Failure reported by the remote session layer.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The scheduler rejected the job or its reply could not be parsed.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// Digest of a transferred file does not match the source.
    #[error("Digest mismatch for {path}: expected {expected}, found {found}")]
    Corruption {
        path: String,
        expected: String,
        found: String,
    },

    /// A transfer gave up after its retry budget.
    #[error("Transfer failed after {attempts} attempt(s): {message}")]
    TransferFailed { attempts: u32, message: String },

    /// Invalid state for the requested operation.
    #[error("Invalid job state: expected {expected}, found {found}")]
    InvalidJobState { expected: String, found: String },

    /// SLURM command execution failed.
    #[error("SLURM command failed: {command} - {message}")]
    SlurmCommandError { command: String, message: String },

    /// SLURM job not found in the queue or the accounting history.
    #[error("SLURM job not found: {0}")]
    SlurmJobNotFound(String),

    /// Run not known to the orchestrator or the store.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Workspace not registered.
    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    /// Timeout waiting for an operation.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation abandoned because the run was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// SQLite database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Whether retrying the same operation may succeed.
    ///
    /// Only transient remote failures qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedError::Remote(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for SchedError {
    fn from(e: rusqlite::Error) -> Self {
        SchedError::DatabaseError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SchedError {
    fn from(e: tokio::task::JoinError) -> Self {
        SchedError::Internal(format!("background task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedError::RunNotFound("run-123".to_string());
        assert_eq!(err.to_string(), "Run not found: run-123");

        let err = SchedError::InvalidJobState {
            expected: "unsubmitted descriptor".to_string(),
            found: "job 12345".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid job state: expected unsubmitted descriptor, found job 12345"
        );

        let err = SchedError::Corruption {
            path: "/scratch/ws-1.tar.gz".to_string(),
            expected: "aa".to_string(),
            found: "bb".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Digest mismatch for /scratch/ws-1.tar.gz: expected aa, found bb"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SchedError::Remote(RemoteError::Connect("reset".into())).is_retryable());
        assert!(SchedError::Remote(RemoteError::Timeout("slow".into())).is_retryable());
        assert!(!SchedError::Remote(RemoteError::Auth("denied".into())).is_retryable());
        assert!(!SchedError::Submission("rejected".into()).is_retryable());
        assert!(
            !SchedError::Corruption {
                path: "x".into(),
                expected: "a".into(),
                found: "b".into(),
            }
            .is_retryable()
        );
    }
}
