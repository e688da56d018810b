//! Persistence layer for run state and workspace metadata.

mod sqlite_store;

pub use sqlite_store::SqliteStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedResult;
use crate::run::{RunFilter, RunId, RunRecord, RunState};

/// Durable storage for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert or update a run. Does not touch the cancel flag.
    async fn save_run(&self, run: &RunRecord) -> SchedResult<()>;

    /// Load a run from the store.
    async fn load_run(&self, run_id: &RunId) -> SchedResult<Option<RunRecord>>;

    /// List runs matching a filter, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<RunRecord>>;

    /// Flag a run for cancellation. Returns `true` if the flag was newly set.
    async fn request_cancel(&self, run_id: &RunId) -> SchedResult<bool>;

    /// Whether cancellation has been requested for a run.
    async fn is_cancel_requested(&self, run_id: &RunId) -> SchedResult<bool>;

    /// Record that the process driving a run is still alive.
    async fn touch_run(&self, run_id: &RunId, at: DateTime<Utc>) -> SchedResult<()>;

    /// Take over an active run whose heartbeat is older than `stale_before`
    /// (or missing). Returns `true` if the caller now owns the run; of several
    /// concurrent claimants at most one wins.
    async fn claim_run(&self, run_id: &RunId, stale_before: DateTime<Utc>) -> SchedResult<bool>;

    /// Delete a run from the store.
    async fn delete_run(&self, run_id: &RunId) -> SchedResult<bool>;
}

/// Workspace metadata owned by the surrounding service.
///
/// Runs read a workspace's location and write back only its status and
/// result pointer.
#[async_trait]
pub trait WorkspaceRegistry: Send + Sync {
    /// Local directory of a workspace.
    async fn workspace_path(&self, workspace_id: &str) -> SchedResult<PathBuf>;

    /// Record the outcome of a run on its workspace.
    async fn record_outcome(
        &self,
        workspace_id: &str,
        run_id: &RunId,
        state: RunState,
        output: Option<&Path>,
    ) -> SchedResult<()>;
}
