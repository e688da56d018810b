//! The narrow channel abstraction every remote endpoint implements.

use std::path::Path;

use async_trait::async_trait;

use crate::error::RemoteResult;

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit status.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Create an output with exit code 0.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Create an output with a non-zero exit code.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Check whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A live, authenticated connection to one remote endpoint.
///
/// Implementations are not required to support concurrent calls; callers
/// serialize access through [`RemoteSession`](crate::RemoteSession).
///
/// | Method | Remote protocol |
/// |--------|-----------------|
/// | `exec` | remote shell |
/// | `upload` / `download` | file copy |
/// | `rename` / `remove` | file copy metadata ops |
/// | `mkdir_all` | remote shell |
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run a command and capture its exit code and output.
    async fn exec(&self, command: &str) -> RemoteResult<CommandOutput>;

    /// Copy a local file to `remote`, returning the number of bytes written.
    async fn upload(&self, local: &Path, remote: &str) -> RemoteResult<u64>;

    /// Copy `remote` to a local file, returning the number of bytes read.
    async fn download(&self, remote: &str, local: &Path) -> RemoteResult<u64>;

    /// Rename a remote file, replacing `to` if it exists.
    async fn rename(&self, from: &str, to: &str) -> RemoteResult<()>;

    /// Remove a remote file. A missing file is not an error.
    async fn remove(&self, path: &str) -> RemoteResult<()>;

    /// Create a remote directory and all its parents.
    async fn mkdir_all(&self, path: &str) -> RemoteResult<()>;

    /// Release the underlying connection.
    async fn disconnect(&self) {}
}

/// Factory for fresh channels to a single endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one attempt at establishing an authenticated channel.
    async fn connect(&self) -> RemoteResult<Box<dyn RemoteChannel>>;

    /// Human-readable endpoint description, used in logs.
    fn endpoint(&self) -> String;
}

/// Quote a string for safe interpolation into a POSIX shell command.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=+%@".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
