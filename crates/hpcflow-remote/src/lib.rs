//! Remote sessions for HPC login nodes.
//!
//! This crate owns the connection to the cluster: an authenticated remote
//! shell plus a file-copy channel, wrapped in a session object that
//! serializes access and reconnects after transient network failures.
//!
//! # Components
//!
//! | Type | Role |
//! |------|------|
//! | [`RemoteChannel`] | One live handle: `exec`, `upload`, `download`, `rename`, `remove` |
//! | [`Connector`] | Makes one connection attempt and returns a fresh channel |
//! | [`RemoteSession`] | Owns at most one handle, serializes calls, reconnects once after a drop |
//! | [`SessionPool`] | Independent sessions leased one per caller |
//! | [`SshConnector`] | libssh2-backed connector (key-based auth, SFTP) |
//! | [`MockRemote`] | Scripted in-memory endpoint for tests |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use hpcflow_remote::{RemoteSession, SessionConfig, SshConfig, SshConnector};
//!
//! let ssh = SshConfig::new("login.hpc.example.org", "ocr", "/home/ocr/.ssh/id_ed25519");
//! let session = RemoteSession::new(Arc::new(SshConnector::new(ssh)), SessionConfig::default());
//! session.open().await?;
//!
//! let out = session.execute("squeue -u ocr", Duration::from_secs(30)).await?;
//! println!("{}", out.stdout);
//!
//! session.close().await;
//! ```

pub mod channel;
pub mod error;
pub mod mock;
pub mod pool;
pub mod session;
pub mod ssh;

pub use channel::{CommandOutput, Connector, RemoteChannel, shell_quote};
pub use error::{RemoteError, RemoteResult};
pub use mock::{MockRemote, MockResponse};
pub use pool::{SessionLease, SessionPool};
pub use session::{ChannelGuard, RemoteSession, SessionConfig};
pub use ssh::{SshConfig, SshConnector};
