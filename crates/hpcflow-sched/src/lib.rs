//! hpcflow Workflow Orchestration on SLURM Clusters
//!
//! This crate runs Nextflow workflows over local workspaces on a remote HPC
//! cluster and brings the results back.
//!
//! # Overview
//!
//! A run moves through the following steps:
//! 1. **Staging**: Pack the workspace and workflow into a bundle, upload and verify it
//! 2. **Submission**: Render a batch script and submit it with `sbatch`
//! 3. **Polling**: Track the job through `squeue` and `sacct` with adaptive backoff
//! 4. **Results**: Download, verify and unpack the output archive
//!
//! # Run States
//!
//! | State | Meaning |
//! |-------|---------|
//! | CREATED | Accepted, nothing remote yet |
//! | STAGING_IN | Bundle being packed and uploaded |
//! | SUBMITTED | Batch job accepted by SLURM |
//! | POLLING | Waiting for the batch job to finish |
//! | STAGING_OUT | Results being downloaded |
//! | DONE | Results unpacked locally |
//! | FAILED | Stopped with a [`FailureReason`] |
//! | CANCELLED | Stopped on request |
//!
//! # Key Features
//!
//! - **Verified Transfers**: SHA-256 checked on both ends, temp name then rename
//! - **Retries**: Exponential backoff with jitter for transient network failures
//! - **At-most-once Submission**: `sbatch` is never retried blindly
//! - **Persistence**: SQLite storage for run state, shared across processes
//! - **Cancellation**: Idempotent, honoured at every step boundary
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hpcflow_sched::{Config, Orchestrator, SlurmExecutor, SqliteStore, TransferManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Some("hpcflow.yaml"))?;
//!     let state_dir = config.paths.state_dir_or("/var/lib/hpcflow".into());
//!     let store = Arc::new(SqliteStore::new(state_dir.join("runs.db"))?);
//!
//!     let orchestrator = Orchestrator::new(
//!         config.orchestrator_config(&state_dir),
//!         config.session_pool(),
//!         TransferManager::new(config.transfer_config()),
//!         Arc::new(SlurmExecutor::new(config.slurm.clone(), config.retry_policy())),
//!         store.clone(),
//!         store,
//!     );
//!
//!     let run_id = orchestrator.submit_run("wf-ocr-default", "ws-1", "OCR-D-IMG", "mets.xml")
//!         .await?;
//!     let status = orchestrator.wait_run(&run_id).await?;
//!     println!("{}: {}", run_id, status.state);
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod persistence;
pub mod retry;
pub mod run;
pub mod slurm;
pub mod transfer;

// Re-exports
pub use bundle::WorkspaceBundle;
pub use config::{Config, ConfigError};
pub use error::{SchedError, SchedResult};
pub use job::{JobDescriptor, JobStatus, SchedulerJobId};
pub use orchestrator::{Orchestrator, OrchestratorConfig, PollConfig};
pub use persistence::{RunStore, SqliteStore, WorkspaceRegistry};
pub use retry::{RetryPolicy, with_retry};
pub use run::{
    FailureKind, FailureReason, RunFilter, RunId, RunRecord, RunRequest, RunState, RunStatus,
};
pub use slurm::{JobExecutor, SlurmConfig, SlurmExecutor};
pub use transfer::{TransferConfig, TransferManager, TransferResult};
