//! SLURM executor: submission, polling, cancellation and log retrieval over a
//! remote session.

use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hpcflow_remote::{RemoteSession, shell_quote};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SchedError, SchedResult};
use crate::job::{JobDescriptor, JobStatus, SchedulerJobId};
use crate::retry::{RetryPolicy, with_retry};
use crate::slurm::parser;
use crate::slurm::templates;

/// squeue output format: id, name, state, reason.
const SQUEUE_FORMAT: &str = "%i|%j|%T|%r";

/// SLURM job state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlurmState {
    Pending,
    Configuring,
    Running,
    Completing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    NodeFail,
    Preempted,
    OutOfMemory,
    BootFail,
    Deadline,
    Requeued,
    RequeueFed,
    RequeueHold,
    Resizing,
    Revoked,
    Signaling,
    SpecialExit,
    StageOut,
    Stopped,
    Suspended,
    Unknown(String),
}

impl SlurmState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        parser::map_state(self).is_terminal()
    }

    /// Check if this represents a successful completion.
    pub fn is_success(&self) -> bool {
        matches!(self, SlurmState::Completed)
    }
}

/// Information about a SLURM job.
#[derive(Debug, Clone)]
pub struct SlurmJobInfo {
    /// SLURM job ID.
    pub job_id: String,

    /// Job name.
    pub name: String,

    /// Current state.
    pub state: SlurmState,

    /// Reason for current state (e.g., "Resources" for pending).
    pub reason: Option<String>,

    /// Exit code (for finished jobs).
    pub exit_code: Option<i32>,
}

/// Configuration for the SLURM executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlurmConfig {
    /// SLURM partition to submit to.
    pub partition: String,

    /// Quality of service.
    pub qos: Option<String>,

    /// SLURM account for billing.
    pub account: Option<String>,

    /// CPUs per task.
    pub cpus: u32,

    /// Memory in GiB.
    pub ram_gb: u32,

    /// Time limit in SLURM notation.
    pub time_limit: String,

    /// Modules to load before running.
    pub modules: Vec<String>,

    /// Apptainer image to run workflow processors in.
    pub container_image: Option<String>,

    /// Nextflow executable on the compute nodes.
    pub nextflow_bin: String,

    /// Forks requested when the run does not say.
    pub default_forks: u32,

    /// Timeout for squeue, sacct, scancel and log reads.
    pub command_timeout_secs: u64,

    /// Timeout for sbatch.
    pub submission_timeout_secs: u64,

    /// Lines of the batch log kept for failure reports.
    pub log_tail_lines: usize,

    /// How long after submission a job missing from squeue and sacct is
    /// reported as UNKNOWN rather than not found.
    pub unknown_grace_secs: u64,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: "standard96s:shared".to_string(),
            qos: Some("48h".to_string()),
            account: None,
            cpus: 2,
            ram_gb: 8,
            time_limit: "48:00:00".to_string(),
            modules: Vec::new(),
            container_image: None,
            nextflow_bin: "nextflow".to_string(),
            default_forks: 4,
            command_timeout_secs: 60,
            submission_timeout_secs: 120,
            log_tail_lines: 50,
            unknown_grace_secs: 120,
        }
    }
}

impl SlurmConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission_timeout_secs)
    }

    pub fn unknown_grace(&self) -> Duration {
        Duration::from_secs(self.unknown_grace_secs)
    }
}

/// Submits, tracks and cancels batch jobs on a remote scheduler.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Render the job script, write it remotely and submit it.
    ///
    /// The descriptor receives the scheduler job id. Submission itself is
    /// attempted once.
    async fn submit(
        &self,
        session: &RemoteSession,
        job: &mut JobDescriptor,
    ) -> SchedResult<SchedulerJobId>;

    /// Current canonical status of a job.
    async fn poll(&self, session: &RemoteSession, job_id: &SchedulerJobId)
    -> SchedResult<JobStatus>;

    /// Best-effort cancellation.
    async fn cancel(&self, session: &RemoteSession, job_id: &SchedulerJobId) -> SchedResult<()>;

    /// Tail of the batch log of a job submitted or tracked by this executor.
    async fn fetch_log(&self, session: &RemoteSession, job_id: &SchedulerJobId)
    -> SchedResult<String>;

    /// Start tracking a job submitted by another process into `remote_dir`.
    fn track(&self, _job_id: &SchedulerJobId, _remote_dir: &str) {}

    /// Forget a job once its run no longer needs it.
    fn release(&self, _job_id: &SchedulerJobId) {}
}

#[derive(Debug, Clone)]
struct Submission {
    /// `None` for jobs this executor did not submit itself.
    at: Option<Instant>,
    log_path: String,
}

/// [`JobExecutor`] for SLURM clusters.
pub struct SlurmExecutor {
    config: SlurmConfig,
    retry: RetryPolicy,
    submissions: Mutex<FxHashMap<SchedulerJobId, Submission>>,
}

impl SlurmExecutor {
    /// Create an executor. `retry` bounds script uploads and status queries.
    pub fn new(config: SlurmConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            submissions: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &SlurmConfig {
        &self.config
    }

    fn submissions(&self) -> std::sync::MutexGuard<'_, FxHashMap<SchedulerJobId, Submission>> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn within_grace(&self, job_id: &SchedulerJobId) -> bool {
        self.submissions()
            .get(job_id)
            .and_then(|s| s.at)
            .is_some_and(|at| at.elapsed() < self.config.unknown_grace())
    }

    async fn upload_script(&self, session: &RemoteSession, job: &JobDescriptor) -> SchedResult<()> {
        let script = job
            .script()
            .ok_or_else(|| SchedError::Internal("job script not rendered".to_string()))?;
        let mut local = tempfile::NamedTempFile::new()?;
        local.write_all(script.as_bytes())?;
        local.flush()?;

        let parent = job
            .script_path
            .rsplit_once('/')
            .map(|(dir, _)| dir)
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/");
        let local_path = local.path();
        let script_path = job.script_path.as_str();
        let timeout = self.config.command_timeout();
        with_retry(&self.retry, "script upload", move |_| async move {
            let mut channel = session.with_channel().await?;
            channel.mkdir_all(parent, timeout).await?;
            channel.upload(local_path, script_path, timeout).await?;
            Ok::<_, SchedError>(())
        })
        .await
        .map_err(|e| SchedError::Submission(format!("could not write job script: {}", e.error)))
    }

    async fn query(
        &self,
        session: &RemoteSession,
        job_id: &SchedulerJobId,
    ) -> SchedResult<Option<SlurmJobInfo>> {
        let timeout = self.config.command_timeout();
        let id = shell_quote(job_id.as_str());

        // First try squeue (for pending/running jobs)
        let squeue = session
            .execute(
                &format!("squeue -j {} -o {}", id, shell_quote(SQUEUE_FORMAT)),
                timeout,
            )
            .await?;
        if squeue.success() {
            if let Some(info) = parser::parse_squeue_output(&squeue.stdout)? {
                return Ok(Some(info));
            }
        } else if !parser::is_unknown_job_error(&squeue.stderr) {
            return Err(SchedError::SlurmCommandError {
                command: "squeue".to_string(),
                message: squeue.stderr.trim().to_string(),
            });
        }

        // Then sacct (for finished jobs)
        let sacct = session
            .execute(
                &format!("sacct -j {} -o JobID,JobName,State,ExitCode -P", id),
                timeout,
            )
            .await?;
        if !sacct.success() {
            return Err(SchedError::SlurmCommandError {
                command: "sacct".to_string(),
                message: sacct.stderr.trim().to_string(),
            });
        }
        parser::parse_sacct_output(&sacct.stdout)
    }
}

#[async_trait]
impl JobExecutor for SlurmExecutor {
    async fn submit(
        &self,
        session: &RemoteSession,
        job: &mut JobDescriptor,
    ) -> SchedResult<SchedulerJobId> {
        if let Some(id) = job.job_id() {
            return Err(SchedError::InvalidJobState {
                expected: "unsubmitted descriptor".to_string(),
                found: format!("submitted as job {id}"),
            });
        }

        let script = templates::generate_batch_script(job, &self.config);
        job.set_script(script)?;
        self.upload_script(session, job).await?;

        let command = format!("sbatch {}", shell_quote(&job.script_path));
        debug!("Running {}", command);
        let output = session
            .execute(&command, self.config.submission_timeout())
            .await
            .map_err(|e| SchedError::Submission(format!("sbatch did not complete: {e}")))?;
        if !output.success() {
            return Err(SchedError::Submission(format!(
                "sbatch exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        let job_id = parser::parse_sbatch_output(&output.stdout)
            .map_err(|e| SchedError::Submission(e.to_string()))?;

        job.assign_job_id(job_id.clone())?;
        self.submissions().insert(
            job_id.clone(),
            Submission {
                at: Some(Instant::now()),
                log_path: templates::log_path(&job.remote_dir, job_id.as_str()),
            },
        );
        info!("Submitted {} as SLURM job {}", job.job_name(), job_id);
        Ok(job_id)
    }

    async fn poll(
        &self,
        session: &RemoteSession,
        job_id: &SchedulerJobId,
    ) -> SchedResult<JobStatus> {
        let info = with_retry(&self.retry, "status query", |_| self.query(session, job_id))
            .await
            .map_err(|e| e.error)?;

        match info {
            Some(info) => {
                if let SlurmState::Unknown(ref raw) = info.state {
                    warn!("SLURM job {} reports unrecognized state {:?}", job_id, raw);
                }
                let status = parser::map_state(&info.state);
                debug!("SLURM job {}: {:?} -> {}", job_id, info.state, status);
                Ok(status)
            }
            None if self.within_grace(job_id) => {
                debug!("SLURM job {} not indexed yet", job_id);
                Ok(JobStatus::Unknown)
            }
            None => Err(SchedError::SlurmJobNotFound(job_id.to_string())),
        }
    }

    async fn cancel(&self, session: &RemoteSession, job_id: &SchedulerJobId) -> SchedResult<()> {
        let output = session
            .execute(
                &format!("scancel {}", shell_quote(job_id.as_str())),
                self.config.command_timeout(),
            )
            .await?;
        parser::parse_scancel_output(output.exit_code, &output.stderr)?;
        info!("Cancelled SLURM job {}", job_id);
        Ok(())
    }

    async fn fetch_log(
        &self,
        session: &RemoteSession,
        job_id: &SchedulerJobId,
    ) -> SchedResult<String> {
        let log_path = self
            .submissions()
            .get(job_id)
            .map(|s| s.log_path.clone())
            .ok_or_else(|| SchedError::SlurmJobNotFound(job_id.to_string()))?;

        let output = session
            .execute(
                &format!(
                    "tail -n {} {}",
                    self.config.log_tail_lines,
                    shell_quote(&log_path)
                ),
                self.config.command_timeout(),
            )
            .await?;
        if !output.success() {
            return Err(SchedError::SlurmCommandError {
                command: "tail".to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn track(&self, job_id: &SchedulerJobId, remote_dir: &str) {
        self.submissions()
            .entry(job_id.clone())
            .or_insert_with(|| Submission {
                at: None,
                log_path: templates::log_path(remote_dir, job_id.as_str()),
            });
    }

    fn release(&self, job_id: &SchedulerJobId) {
        self.submissions().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use hpcflow_remote::{CommandOutput, MockRemote, SessionConfig};

    use super::*;

    fn executor() -> SlurmExecutor {
        SlurmExecutor::new(
            SlurmConfig::default(),
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_backoff(Duration::from_millis(10), Duration::from_millis(50)),
        )
    }

    fn job() -> JobDescriptor {
        JobDescriptor::new("wf-ocr-default", "ws-1", "/scratch/slurm_workspaces/r1")
            .with_script_path("/scratch/batch_scripts/r1.sh")
    }

    #[test]
    fn test_slurm_state() {
        assert!(SlurmState::Completed.is_terminal());
        assert!(SlurmState::Failed.is_terminal());
        assert!(SlurmState::Cancelled.is_terminal());
        assert!(!SlurmState::Pending.is_terminal());
        assert!(!SlurmState::Running.is_terminal());

        assert!(SlurmState::Completed.is_success());
        assert!(!SlurmState::Failed.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_writes_script_and_parses_id() {
        let remote = MockRemote::new();
        remote.respond("sbatch", "Submitted batch job 12345\n");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();

        let mut job = job();
        let job_id = executor.submit(&session, &mut job).await.unwrap();
        assert_eq!(job_id.as_str(), "12345");
        assert_eq!(job.job_id(), Some(&job_id));

        let script = String::from_utf8(remote.file("/scratch/batch_scripts/r1.sh").unwrap()).unwrap();
        assert_eq!(Some(script.as_str()), job.script());
        assert_eq!(remote.count_commands("mkdir -p /scratch/batch_scripts"), 1);
        assert_eq!(remote.count_commands("sbatch /scratch/batch_scripts/r1.sh"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejects_submitted_descriptor() {
        let remote = MockRemote::new();
        remote.respond("sbatch", "Submitted batch job 12345\n");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();

        let mut job = job();
        executor.submit(&session, &mut job).await.unwrap();
        let err = executor.submit(&session, &mut job).await.unwrap_err();
        assert!(matches!(err, SchedError::InvalidJobState { .. }));
        assert_eq!(remote.count_commands("sbatch"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rejection_is_submission_error() {
        let remote = MockRemote::new();
        remote.respond_output(
            "sbatch",
            CommandOutput::failed(1, "sbatch: error: invalid partition specified"),
        );
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());

        let mut job = job();
        let err = executor().submit(&session, &mut job).await.unwrap_err();
        assert!(matches!(err, SchedError::Submission(ref m) if m.contains("invalid partition")));
        assert!(job.job_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sbatch_is_not_retried_on_connection_loss() {
        let remote = MockRemote::new();
        remote.respond_connect_error("sbatch", "connection reset by peer");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());

        let err = executor().submit(&session, &mut job()).await.unwrap_err();
        assert!(matches!(err, SchedError::Submission(_)));
        assert_eq!(remote.count_commands("sbatch"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_maps_squeue_then_sacct() {
        let remote = MockRemote::new();
        remote.respond("squeue", "JOBID|NAME|STATE|REASON\n12345|wf|RUNNING|None\n");
        remote.respond_output(
            "squeue",
            CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id specified"),
        );
        remote.respond(
            "sacct",
            "JobID|JobName|State|ExitCode\n12345|wf|COMPLETED|0:0\n12345.batch|batch|COMPLETED|0:0\n",
        );
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();
        let id = SchedulerJobId::new("12345");

        assert_eq!(executor.poll(&session, &id).await.unwrap(), JobStatus::Running);
        assert_eq!(remote.count_commands("sacct"), 0);
        assert_eq!(executor.poll(&session, &id).await.unwrap(), JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_job_is_unknown_within_grace_window() {
        let remote = MockRemote::new();
        remote.respond("sbatch", "Submitted batch job 12345\n");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();
        let id = executor.submit(&session, &mut job()).await.unwrap();

        // Neither squeue nor sacct know the job yet.
        assert_eq!(executor.poll(&session, &id).await.unwrap(), JobStatus::Unknown);

        tokio::time::advance(executor.config().unknown_grace() + Duration::from_secs(1)).await;
        let err = executor.poll(&session, &id).await.unwrap_err();
        assert!(matches!(err, SchedError::SlurmJobNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tolerates_finished_job() {
        let remote = MockRemote::new();
        remote.respond_output(
            "scancel",
            CommandOutput::failed(1, "scancel: error: Kill job error on job id 12345: Invalid job id specified"),
        );
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        executor()
            .cancel(&session, &SchedulerJobId::new("12345"))
            .await
            .unwrap();
        assert_eq!(remote.count_commands("scancel 12345"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_log_tails_batch_log() {
        let remote = MockRemote::new();
        remote.respond("sbatch", "Submitted batch job 12345\n");
        remote.respond("tail -n 50 /scratch/slurm_workspaces/r1/slurm-job-12345.txt", "ERROR: ocrd-tesserocr-recognize failed\n");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();
        let id = executor.submit(&session, &mut job()).await.unwrap();

        let log = executor.fetch_log(&session, &id).await.unwrap();
        assert!(log.contains("tesserocr"));

        let err = executor
            .fetch_log(&session, &SchedulerJobId::new("999"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::SlurmJobNotFound(_)));

        executor.release(&id);
        assert!(executor.fetch_log(&session, &id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracked_job_has_log_but_no_grace() {
        let remote = MockRemote::new();
        remote.respond("tail -n 50 /scratch/slurm_workspaces/r1/slurm-job-777.txt", "nextflow exited\n");
        let session = RemoteSession::new(remote.connector(), SessionConfig::default());
        let executor = executor();
        let id = SchedulerJobId::new("777");

        executor.track(&id, "/scratch/slurm_workspaces/r1");
        assert_eq!(executor.fetch_log(&session, &id).await.unwrap(), "nextflow exited\n");

        // Missing from squeue and sacct: a recovered job gets no grace window.
        let err = executor.poll(&session, &id).await.unwrap_err();
        assert!(matches!(err, SchedError::SlurmJobNotFound(_)));
    }
}
