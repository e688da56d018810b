//! Reconnect-capable session over a single remote channel.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::error::Elapsed;

use crate::channel::{CommandOutput, Connector, RemoteChannel};
use crate::error::{RemoteError, RemoteResult};

/// Tuning for explicit [`RemoteSession::open`] calls.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection attempts made by `open()` before giving up.
    pub open_attempts: u32,

    /// Pause between `open()` attempts.
    pub open_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_attempts: 5,
            open_retry_delay: Duration::from_secs(2),
        }
    }
}

/// An owned, reconnectable connection to one remote endpoint.
///
/// At most one channel handle exists per session. Every call takes the
/// session mutex, so no two commands ever interleave on the same handle.
///
/// After a connection-level failure (or a timeout, since a blocking call may
/// still be in flight on the old handle) the handle is discarded and the
/// session is marked not-live. The next call makes exactly one reconnect
/// attempt before failing.
pub struct RemoteSession {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    endpoint: String,
    handle: Mutex<Option<Box<dyn RemoteChannel>>>,
    live: AtomicBool,
    closed: AtomicBool,
    last_activity_ms: AtomicI64,
}

impl RemoteSession {
    /// Create a session. No connection is made until first use or [`open`](Self::open).
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        let endpoint = connector.endpoint();
        Self {
            connector,
            config,
            endpoint,
            handle: Mutex::new(None),
            live: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_activity_ms: AtomicI64::new(0),
        }
    }

    /// The endpoint this session talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the session currently holds a usable handle.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Time of the last successful remote call.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }

    /// Establish the channel, retrying connection failures.
    ///
    /// Authentication failures are returned immediately. Re-opens a session
    /// that was previously closed.
    pub async fn open(&self) -> RemoteResult<()> {
        let mut handle = self.handle.lock().await;
        self.closed.store(false, Ordering::SeqCst);
        if handle.is_some() && self.is_live() {
            return Ok(());
        }

        let attempts = self.config.open_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(channel) => {
                    *handle = Some(channel);
                    self.mark_live();
                    tracing::info!("Connected to {} (attempt {})", self.endpoint, attempt);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    tracing::warn!(
                        "Connection to {} failed (attempt {}/{}): {}",
                        self.endpoint,
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(self.config.open_retry_delay).await;
                }
                Err(e) => {
                    tracing::error!("Could not connect to {}: {}", self.endpoint, e);
                    return Err(e);
                }
            }
        }
    }

    /// Take exclusive access to the channel for a multi-step operation.
    ///
    /// Connects (one attempt) if the session is not live.
    pub async fn with_channel(&self) -> RemoteResult<ChannelGuard<'_>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }

        let mut handle = self.handle.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }

        if handle.is_none() || !self.is_live() {
            *handle = None;
            match self.connector.connect().await {
                Ok(channel) => {
                    *handle = Some(channel);
                    self.mark_live();
                    tracing::info!("Reconnected to {}", self.endpoint);
                }
                Err(e) => {
                    tracing::warn!("Reconnect to {} failed: {}", self.endpoint, e);
                    return Err(e);
                }
            }
        }

        Ok(ChannelGuard {
            session: self,
            handle,
        })
    }

    /// Run a single command with a mandatory timeout.
    pub async fn execute(&self, command: &str, timeout: Duration) -> RemoteResult<CommandOutput> {
        self.with_channel().await?.execute(command, timeout).await
    }

    /// Release the channel. Safe to call more than once.
    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        self.live.store(false, Ordering::SeqCst);
        if let Some(channel) = handle.take() {
            channel.disconnect().await;
            tracing::info!("Closed session to {}", self.endpoint);
        }
    }

    fn mark_live(&self) {
        self.live.store(true, Ordering::SeqCst);
        self.touch();
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("endpoint", &self.endpoint)
            .field("live", &self.is_live())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Exclusive, scoped access to a session's channel.
///
/// Holding the guard blocks every other caller of the same session.
pub struct ChannelGuard<'a> {
    session: &'a RemoteSession,
    handle: MutexGuard<'a, Option<Box<dyn RemoteChannel>>>,
}

impl ChannelGuard<'_> {
    /// Run a command on the held channel.
    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> RemoteResult<CommandOutput> {
        tracing::debug!("[{}] $ {}", self.session.endpoint, command);
        let outcome = tokio::time::timeout(timeout, self.channel()?.exec(command)).await;
        self.settle("command", timeout, outcome)
    }

    /// Upload a local file to `remote`.
    pub async fn upload(&mut self, local: &Path, remote: &str, timeout: Duration) -> RemoteResult<u64> {
        let outcome = tokio::time::timeout(timeout, self.channel()?.upload(local, remote)).await;
        self.settle("upload", timeout, outcome)
    }

    /// Download `remote` into a local file.
    pub async fn download(
        &mut self,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> RemoteResult<u64> {
        let outcome = tokio::time::timeout(timeout, self.channel()?.download(remote, local)).await;
        self.settle("download", timeout, outcome)
    }

    /// Rename a remote file, replacing the destination.
    pub async fn rename(&mut self, from: &str, to: &str, timeout: Duration) -> RemoteResult<()> {
        let outcome = tokio::time::timeout(timeout, self.channel()?.rename(from, to)).await;
        self.settle("rename", timeout, outcome)
    }

    /// Remove a remote file if it exists.
    pub async fn remove(&mut self, path: &str, timeout: Duration) -> RemoteResult<()> {
        let outcome = tokio::time::timeout(timeout, self.channel()?.remove(path)).await;
        self.settle("remove", timeout, outcome)
    }

    /// Create a remote directory tree.
    pub async fn mkdir_all(&mut self, path: &str, timeout: Duration) -> RemoteResult<()> {
        let outcome = tokio::time::timeout(timeout, self.channel()?.mkdir_all(path)).await;
        self.settle("mkdir", timeout, outcome)
    }

    fn channel(&self) -> RemoteResult<&dyn RemoteChannel> {
        self.handle.as_deref().ok_or_else(|| {
            RemoteError::Connect(format!(
                "connection to {} was lost earlier in this operation",
                self.session.endpoint
            ))
        })
    }

    fn settle<T>(
        &mut self,
        what: &str,
        timeout: Duration,
        outcome: Result<RemoteResult<T>, Elapsed>,
    ) -> RemoteResult<T> {
        match outcome {
            Ok(Ok(value)) => {
                self.session.touch();
                Ok(value)
            }
            Ok(Err(e)) => {
                if matches!(e, RemoteError::Connect(_) | RemoteError::Timeout(_)) {
                    self.invalidate(&e.to_string());
                }
                Err(e)
            }
            Err(_) => {
                let message = format!("{what} on {} timed out after {timeout:?}", self.session.endpoint);
                self.invalidate(&message);
                Err(RemoteError::Timeout(message))
            }
        }
    }

    fn invalidate(&mut self, cause: &str) {
        if self.handle.take().is_some() {
            tracing::warn!("Dropping channel to {}: {}", self.session.endpoint, cause);
        }
        self.session.live.store(false, Ordering::SeqCst);
    }
}

impl Deref for ChannelGuard<'_> {
    type Target = RemoteSession;

    fn deref(&self) -> &RemoteSession {
        self.session
    }
}
