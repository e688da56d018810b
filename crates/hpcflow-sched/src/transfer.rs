//! All-or-nothing staging of bundles and results over a remote session.
//!
//! Every transfer writes to `<final>.partial` on the destination side,
//! verifies the SHA-256 digest, and only then renames into place. A failed
//! transfer never leaves anything at the final path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use hpcflow_remote::{ChannelGuard, RemoteError, RemoteSession, shell_quote};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::{WorkspaceBundle, file_digest};
use crate::error::{SchedError, SchedResult};
use crate::retry::{Exhausted, RetryPolicy, with_retry};

/// Suffix of in-flight files.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Local to remote.
    Out,
    /// Remote to local.
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Ok,
    Failed,
}

/// Why a transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFailure {
    /// The destination digest does not match the source.
    Corruption { expected: String, found: String },
    /// Transient errors used up the attempt budget.
    Exhausted { attempts: u32, last_error: String },
    /// A non-retryable error.
    Fatal { message: String },
}

impl TransferFailure {
    fn from_exhausted(exhausted: Exhausted) -> Self {
        match exhausted.error {
            SchedError::Corruption {
                expected, found, ..
            } => TransferFailure::Corruption { expected, found },
            error if error.is_retryable() => TransferFailure::Exhausted {
                attempts: exhausted.attempts,
                last_error: error.to_string(),
            },
            error => TransferFailure::Fatal {
                message: error.to_string(),
            },
        }
    }
}

impl std::fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferFailure::Corruption { expected, found } => {
                write!(f, "corruption: expected sha256 {expected}, found {found}")
            }
            TransferFailure::Exhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempt(s): {last_error}"),
            TransferFailure::Fatal { message } => f.write_str(message),
        }
    }
}

/// Outcome of one staging operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub bundle_id: String,
    pub direction: TransferDirection,
    pub bytes: u64,
    pub digest_match: bool,
    pub outcome: TransferOutcome,
    pub attempts: u32,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub failure: Option<TransferFailure>,
}

impl TransferResult {
    pub fn is_ok(&self) -> bool {
        self.outcome == TransferOutcome::Ok
    }
}

/// Timeouts and retry bounds for transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub retry: RetryPolicy,
    /// Upper bound on one upload or download.
    pub transfer_timeout: Duration,
    /// Upper bound on hashing, renaming and cleanup commands.
    pub command_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            transfer_timeout: Duration::from_secs(1800),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Moves bundles to the cluster and results back.
pub struct TransferManager {
    config: TransferConfig,
}

impl TransferManager {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Upload `bundle` into `remote_dir` and verify it there.
    ///
    /// On success the bundle records its remote path.
    pub async fn stage_out(
        &self,
        session: &RemoteSession,
        bundle: &mut WorkspaceBundle,
        remote_dir: &str,
    ) -> TransferResult {
        let final_path = format!("{}/{}", remote_dir.trim_end_matches('/'), bundle.file_name());
        let partial = format!("{final_path}{PARTIAL_SUFFIX}");
        info!(
            "Staging bundle {} ({} bytes) to {}:{}",
            bundle.id(),
            bundle.size(),
            session.endpoint(),
            final_path
        );

        let mut attempts = 0;
        let outcome = with_retry(&self.config.retry, "stage out", |attempt| {
            attempts = attempt;
            self.upload_attempt(session, bundle, remote_dir, &partial, &final_path)
        })
        .await;

        let mut result = TransferResult {
            bundle_id: bundle.id().to_string(),
            direction: TransferDirection::Out,
            bytes: 0,
            digest_match: false,
            outcome: TransferOutcome::Failed,
            attempts,
            remote_path: final_path.clone(),
            local_path: bundle.local_path().to_path_buf(),
            failure: None,
        };
        match outcome {
            Ok(bytes) => {
                bundle.set_staged(final_path);
                result.bytes = bytes;
                result.digest_match = true;
                result.outcome = TransferOutcome::Ok;
                info!("Bundle {} staged after {} attempt(s)", bundle.id(), attempts);
            }
            Err(exhausted) => {
                self.discard_remote(session, &partial).await;
                let failure = TransferFailure::from_exhausted(exhausted);
                warn!("Staging bundle {} failed: {}", bundle.id(), failure);
                result.failure = Some(failure);
            }
        }
        result
    }

    /// Download `remote_path` to `local_path` and verify it.
    pub async fn stage_in(
        &self,
        session: &RemoteSession,
        remote_path: &str,
        local_path: &Path,
    ) -> TransferResult {
        let partial = partial_path(local_path);
        let bundle_id = remote_path
            .rsplit('/')
            .next()
            .unwrap_or(remote_path)
            .to_string();
        info!(
            "Retrieving {}:{} to {}",
            session.endpoint(),
            remote_path,
            local_path.display()
        );

        let mut attempts = 0;
        let outcome = with_retry(&self.config.retry, "stage in", |attempt| {
            attempts = attempt;
            self.download_attempt(session, remote_path, &partial, local_path)
        })
        .await;

        let mut result = TransferResult {
            bundle_id,
            direction: TransferDirection::In,
            bytes: 0,
            digest_match: false,
            outcome: TransferOutcome::Failed,
            attempts,
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            failure: None,
        };
        match outcome {
            Ok(bytes) => {
                result.bytes = bytes;
                result.digest_match = true;
                result.outcome = TransferOutcome::Ok;
            }
            Err(exhausted) => {
                let _ = tokio::fs::remove_file(&partial).await;
                let failure = TransferFailure::from_exhausted(exhausted);
                warn!("Retrieving {} failed: {}", remote_path, failure);
                result.failure = Some(failure);
            }
        }
        result
    }

    async fn upload_attempt(
        &self,
        session: &RemoteSession,
        bundle: &WorkspaceBundle,
        remote_dir: &str,
        partial: &str,
        final_path: &str,
    ) -> SchedResult<u64> {
        let timeout = self.config.command_timeout;
        let mut channel = session.with_channel().await?;
        channel.mkdir_all(remote_dir, timeout).await?;
        // Leftover from an interrupted attempt; the upload truncates it anyway.
        if let Err(e) = channel.remove(partial, timeout).await {
            debug!("Could not remove leftover {}: {}", partial, e);
        }

        let bytes = channel
            .upload(bundle.local_path(), partial, self.config.transfer_timeout)
            .await?;
        let found = remote_digest(&mut channel, partial, timeout).await?;
        if found != bundle.digest() {
            if let Err(e) = channel.remove(partial, timeout).await {
                warn!("Could not remove corrupted {}: {}", partial, e);
            }
            return Err(SchedError::Corruption {
                path: final_path.to_string(),
                expected: bundle.digest().to_string(),
                found,
            });
        }
        channel.rename(partial, final_path, timeout).await?;
        debug!("Verified {} ({} bytes)", final_path, bytes);
        Ok(bytes)
    }

    async fn download_attempt(
        &self,
        session: &RemoteSession,
        remote_path: &str,
        partial: &Path,
        local_path: &Path,
    ) -> SchedResult<u64> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut channel = session.with_channel().await?;
        let expected = remote_digest(&mut channel, remote_path, self.config.command_timeout).await?;
        let bytes = channel
            .download(remote_path, partial, self.config.transfer_timeout)
            .await?;
        drop(channel);

        let owned = partial.to_path_buf();
        let found = tokio::task::spawn_blocking(move || file_digest(&owned)).await??;
        if found != expected {
            if let Err(e) = tokio::fs::remove_file(partial).await {
                warn!("Could not remove corrupted {}: {}", partial.display(), e);
            }
            return Err(SchedError::Corruption {
                path: local_path.display().to_string(),
                expected,
                found,
            });
        }
        tokio::fs::rename(partial, local_path).await?;
        Ok(bytes)
    }

    /// Best-effort removal of an in-flight remote file after a failed transfer.
    async fn discard_remote(&self, session: &RemoteSession, partial: &str) {
        let cleanup = async {
            let mut channel = session.with_channel().await?;
            channel.remove(partial, self.config.command_timeout).await
        };
        if let Err(e) = cleanup.await {
            warn!("Could not remove {} after failed transfer: {}", partial, e);
        }
    }
}

fn partial_path(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Hash a remote file with `sha256sum`.
pub async fn remote_digest(
    channel: &mut ChannelGuard<'_>,
    path: &str,
    timeout: Duration,
) -> SchedResult<String> {
    let output = channel
        .execute(&format!("sha256sum {}", shell_quote(path)), timeout)
        .await?;
    if !output.success() {
        return Err(RemoteError::Transfer(format!(
            "sha256sum {} exited with {}: {}",
            path,
            output.exit_code,
            output.stderr.trim()
        ))
        .into());
    }
    match output.stdout.split_whitespace().next() {
        Some(digest) if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) => {
            Ok(digest.to_ascii_lowercase())
        }
        _ => Err(SchedError::Internal(format!(
            "unexpected sha256sum output: {}",
            output.stdout.trim()
        ))),
    }
}
