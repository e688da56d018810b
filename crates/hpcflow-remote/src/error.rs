//! Error handling for remote sessions.

use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors that can occur while talking to a remote endpoint.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RemoteError {
    /// Network-layer failure: TCP connect, handshake, or a dropped channel.
    #[error("Connection error: {0}")]
    Connect(String),

    /// Credentials were rejected or could not be loaded.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A remote call did not finish within its deadline.
    ///
    /// The remote side may still be executing the command.
    #[error("Remote call timed out: {0}")]
    Timeout(String),

    /// File-level failure reported by the transfer channel (missing path, permissions).
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// The session was explicitly closed.
    #[error("Session closed")]
    Closed,

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker task panicked or was aborted.
    #[error("Task join error: {0}")]
    Task(String),
}

impl RemoteError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Connect(_) | RemoteError::Timeout(_))
    }
}

impl From<tokio::task::JoinError> for RemoteError {
    fn from(e: tokio::task::JoinError) -> Self {
        RemoteError::Task(e.to_string())
    }
}
