//! Run orchestration.
//!
//! Each submitted run is driven by its own task through
//! `CREATED → STAGING_IN → SUBMITTED → POLLING → STAGING_OUT → DONE`, with
//! `FAILED` and `CANCELLED` reachable from every non-terminal state. Every
//! transition is persisted before it becomes visible to readers.
//!
//! The driving process refreshes a heartbeat on the run record. A run whose
//! heartbeat is older than the owner lease is taken over by the next
//! orchestrator that waits on it, cancels it or calls [`Orchestrator::recover`],
//! and is continued from its persisted SLURM job id.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hpcflow_remote::SessionPool;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bundle::{WorkspaceBundle, unpack_archive};
use crate::error::{SchedError, SchedResult};
use crate::job::{JobDescriptor, JobStatus, OUTPUT_ARCHIVE, SchedulerJobId};
use crate::persistence::{RunStore, WorkspaceRegistry};
use crate::run::{
    FailureKind, FailureReason, RunFilter, RunId, RunRecord, RunRequest, RunState, RunStatus,
};
use crate::slurm::JobExecutor;
use crate::transfer::TransferManager;

/// How long a finished run stays in memory before only the store answers for it.
const SLOT_RETENTION: Duration = Duration::from_secs(300);

/// Status polling cadence and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// First interval, and the interval after every observed status change.
    pub interval_min_secs: u64,

    /// Upper bound for the backed-off interval.
    pub interval_max_secs: u64,

    /// Growth factor applied while the status is unchanged.
    pub backoff_factor: f64,

    /// Wall-clock budget for the polling phase.
    pub max_run_secs: u64,

    /// Consecutive UNKNOWN results tolerated before the run fails.
    pub max_unknown_polls: u32,

    /// A run whose driver has not refreshed its heartbeat for this long may
    /// be taken over by another orchestrator.
    pub owner_lease_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_min_secs: 5,
            interval_max_secs: 300,
            backoff_factor: 2.0,
            max_run_secs: 72 * 3600,
            max_unknown_polls: 10,
            owner_lease_secs: 900,
        }
    }
}

impl PollConfig {
    pub fn interval_min(&self) -> Duration {
        Duration::from_secs(self.interval_min_secs.max(1))
    }

    pub fn interval_max(&self) -> Duration {
        Duration::from_secs(self.interval_max_secs).max(self.interval_min())
    }

    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(self.max_run_secs)
    }

    pub fn owner_lease(&self) -> Duration {
        Duration::from_secs(self.owner_lease_secs.max(3))
    }

    /// The interval following `current` when nothing changed.
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_factor.max(1.0))
            .min(self.interval_max())
    }
}

/// Directories and limits used by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root of the remote layout on the cluster.
    pub remote_root: String,

    /// Local directory holding `<workflow_id>.nf` templates.
    pub template_dir: PathBuf,

    /// Local directory for bundles awaiting upload.
    pub staging_dir: PathBuf,

    /// Local directory that receives unpacked results.
    pub output_dir: PathBuf,

    pub polling: PollConfig,
}

impl OrchestratorConfig {
    pub fn new(
        remote_root: impl Into<String>,
        template_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote_root: remote_root.into(),
            template_dir: template_dir.into(),
            staging_dir: staging_dir.into(),
            output_dir: output_dir.into(),
            polling: PollConfig::default(),
        }
    }

    pub fn with_polling(mut self, polling: PollConfig) -> Self {
        self.polling = polling;
        self
    }

    /// Remote working directory of a run.
    pub fn run_dir(&self, run_id: &RunId) -> String {
        format!(
            "{}/slurm_workspaces/{}",
            self.remote_root.trim_end_matches('/'),
            run_id
        )
    }

    /// Remote path of a run's batch script.
    pub fn script_path(&self, run_id: &RunId) -> String {
        format!(
            "{}/batch_scripts/{}.sh",
            self.remote_root.trim_end_matches('/'),
            run_id
        )
    }

    /// Local Nextflow template for a workflow.
    pub fn workflow_script(&self, workflow_id: &str) -> PathBuf {
        self.template_dir.join(format!("{workflow_id}.nf"))
    }

    /// Local directory that receives a run's results.
    pub fn run_output_dir(&self, run_id: &RunId) -> PathBuf {
        self.output_dir.join(run_id.to_string())
    }
}

/// Per-run bookkeeping shared between the driving task and readers.
struct RunSlot {
    record: RwLock<RunRecord>,
    cancel: AtomicBool,
    wake: Notify,
    state: watch::Sender<RunState>,
}

enum Outcome {
    Done(PathBuf),
    Failed(FailureReason),
    Cancelled(String),
}

impl Outcome {
    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failed(FailureReason::new(kind, message))
    }
}

/// Where a run's driving task picks up.
#[derive(Debug, Clone, Copy)]
enum Start {
    Fresh,
    /// Taken over from a driver that stopped.
    Resume,
}

enum PollEnd {
    Succeeded,
    RemoteFailed,
    RemoteCancelled,
    TimedOut,
    Unavailable(String),
    CancelRequested,
}

/// Drives runs from submission to a terminal state.
///
/// Cloning is cheap; all clones share the same runs.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    pool: SessionPool,
    transfer: TransferManager,
    executor: Arc<dyn JobExecutor>,
    store: Arc<dyn RunStore>,
    workspaces: Arc<dyn WorkspaceRegistry>,
    runs: RwLock<FxHashMap<RunId, Arc<RunSlot>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        pool: SessionPool,
        transfer: TransferManager,
        executor: Arc<dyn JobExecutor>,
        store: Arc<dyn RunStore>,
        workspaces: Arc<dyn WorkspaceRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                pool,
                transfer,
                executor,
                store,
                workspaces,
                runs: RwLock::new(FxHashMap::default()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Start a run of `workflow_id` on `workspace_id`.
    pub async fn submit_run(
        &self,
        workflow_id: &str,
        workspace_id: &str,
        input_file_group: &str,
        mets_filename: &str,
    ) -> SchedResult<RunId> {
        self.submit_request(RunRequest::new(
            workflow_id,
            workspace_id,
            input_file_group,
            mets_filename,
        ))
        .await
    }

    /// Start a run and return its id without waiting for any remote step.
    ///
    /// Unknown workspaces and workflows are rejected here; no run is created
    /// for them.
    pub async fn submit_request(&self, request: RunRequest) -> SchedResult<RunId> {
        request.validate()?;

        let template = self.inner.config.workflow_script(&request.workflow_id);
        if !tokio::fs::try_exists(&template).await.unwrap_or(false) {
            return Err(SchedError::ConfigError(format!(
                "no workflow template '{}' at {}",
                request.workflow_id,
                template.display()
            )));
        }
        self.inner
            .workspaces
            .workspace_path(&request.workspace_id)
            .await?;

        let mut record = RunRecord::new(request);
        record.remote_dir = Some(self.inner.config.run_dir(&record.id));
        self.inner.store.save_run(&record).await?;

        let run_id = record.id;
        info!(
            "Run {} created: workflow {} on workspace {}",
            run_id, record.request.workflow_id, record.request.workspace_id
        );
        self.inner.start(record, Start::Fresh).await;
        Ok(run_id)
    }

    /// Current status of a run, from memory or the store.
    pub async fn get_run_status(&self, run_id: &RunId) -> SchedResult<RunStatus> {
        if let Some(slot) = self.slot(run_id).await {
            let mut status = slot.record.read().await.status();
            status.cancel_requested |= slot.cancel.load(Ordering::SeqCst);
            return Ok(status);
        }
        match self.inner.store.load_run(run_id).await? {
            Some(record) => Ok(record.status()),
            None => Err(SchedError::RunNotFound(run_id.to_string())),
        }
    }

    /// Request cancellation of a run.
    ///
    /// Idempotent: repeated requests and requests for finished runs succeed
    /// without further effect. Runs owned by another process are flagged in
    /// the store and picked up by their owner at its next step boundary; an
    /// orphaned run is taken over here and cancelled.
    pub async fn cancel_run(&self, run_id: &RunId) -> SchedResult<()> {
        if let Some(slot) = self.slot(run_id).await {
            if slot.record.read().await.state.is_terminal() {
                debug!("Run {} already finished; cancel ignored", run_id);
                return Ok(());
            }
            if slot.cancel.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            info!("Cancellation requested for run {}", run_id);
            if let Err(e) = self.inner.store.request_cancel(run_id).await {
                warn!("Could not persist cancel flag for run {}: {}", run_id, e);
            }
            slot.wake.notify_one();
            return Ok(());
        }

        let record = self
            .inner
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| SchedError::RunNotFound(run_id.to_string()))?;
        if record.state.is_terminal() {
            return Ok(());
        }
        if self.inner.store.request_cancel(run_id).await? {
            info!("Cancellation of run {} recorded for its owner", run_id);
        }
        if record.is_orphaned(self.inner.config.polling.owner_lease(), Utc::now()) {
            if let Some(slot) = self.adopt(run_id).await? {
                slot.wake.notify_one();
            }
        }
        Ok(())
    }

    /// Wait until a run reaches a terminal state.
    ///
    /// A run driven elsewhere is watched through the store; if its driver
    /// stops, this orchestrator takes it over.
    pub async fn wait_run(&self, run_id: &RunId) -> SchedResult<RunStatus> {
        if let Some(slot) = self.slot(run_id).await {
            return wait_slot(&slot, run_id).await;
        }

        let lease = self.inner.config.polling.owner_lease();
        loop {
            let record = self
                .inner
                .store
                .load_run(run_id)
                .await?
                .ok_or_else(|| SchedError::RunNotFound(run_id.to_string()))?;
            if record.state.is_terminal() {
                return Ok(record.status());
            }
            if record.is_orphaned(lease, Utc::now()) {
                if let Some(slot) = self.adopt(run_id).await? {
                    return wait_slot(&slot, run_id).await;
                }
            }
            tokio::time::sleep(self.inner.config.polling.interval_min()).await;
        }
    }

    /// Take over every active run whose driver has stopped.
    ///
    /// Runs that reached the scheduler continue polling from their persisted
    /// job id; runs lost before submission fail. Returns the runs taken over.
    pub async fn recover(&self) -> SchedResult<Vec<RunId>> {
        let lease = self.inner.config.polling.owner_lease();
        let now = Utc::now();
        let mut adopted = Vec::new();
        for record in self.inner.store.list_runs(&RunFilter::active()).await? {
            if !record.is_orphaned(lease, now) || self.slot(&record.id).await.is_some() {
                continue;
            }
            if self.adopt(&record.id).await?.is_some() {
                adopted.push(record.id);
            }
        }
        if !adopted.is_empty() {
            info!("Recovered {} orphaned run(s)", adopted.len());
        }
        Ok(adopted)
    }

    /// Whether this orchestrator holds the run in memory, because it drives
    /// the run or finished it recently.
    pub async fn is_driving(&self, run_id: &RunId) -> bool {
        self.slot(run_id).await.is_some()
    }

    /// Runs in the store matching `filter`, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> SchedResult<Vec<RunStatus>> {
        let records = self.inner.store.list_runs(filter).await?;
        Ok(records.iter().map(RunRecord::status).collect())
    }

    /// Close all remote sessions. Runs still in flight fail at their next
    /// remote step.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.pool.close_all().await;
    }

    async fn slot(&self, run_id: &RunId) -> Option<Arc<RunSlot>> {
        self.inner.runs.read().await.get(run_id).cloned()
    }

    /// Claim an orphaned run in the store and start driving it here.
    ///
    /// Returns `None` if another orchestrator claimed it first.
    async fn adopt(&self, run_id: &RunId) -> SchedResult<Option<Arc<RunSlot>>> {
        if !self.inner.store.claim_run(run_id, self.inner.stale_before()?).await? {
            return Ok(None);
        }
        let Some(record) = self.inner.store.load_run(run_id).await? else {
            return Ok(None);
        };
        warn!(
            "Taking over run {} in {}; its driver stopped reporting",
            run_id, record.state
        );
        Ok(Some(self.inner.start(record, Start::Resume).await))
    }
}

async fn wait_slot(slot: &RunSlot, run_id: &RunId) -> SchedResult<RunStatus> {
    let mut rx = slot.state.subscribe();
    rx.wait_for(|state| state.is_terminal())
        .await
        .map_err(|_| SchedError::Internal(format!("run {run_id} lost its driver")))?;
    Ok(slot.record.read().await.status())
}

impl Inner {
    /// Register a run in memory and spawn its driving task.
    async fn start(self: &Arc<Self>, record: RunRecord, start: Start) -> Arc<RunSlot> {
        let run_id = record.id;
        let cancel = AtomicBool::new(record.cancel_requested);
        let (state, _) = watch::channel(record.state);
        let slot = Arc::new(RunSlot {
            record: RwLock::new(record),
            cancel,
            wake: Notify::new(),
            state,
        });
        self.runs.write().await.insert(run_id, slot.clone());

        let inner = self.clone();
        let driven = slot.clone();
        tokio::spawn(async move {
            inner.drive(driven, start).await;
        });
        slot
    }

    async fn drive(self: Arc<Self>, slot: Arc<RunSlot>, start: Start) {
        let run_id = slot.record.read().await.id;
        let heartbeat = tokio::spawn(self.clone().keep_alive(run_id));
        let outcome = match start {
            Start::Fresh => self.execute(&slot).await,
            Start::Resume => self.resume(&slot).await,
        };
        heartbeat.abort();

        if let Some(job_id) = slot.record.read().await.scheduler_job_id.clone() {
            self.executor.release(&job_id);
        }
        self.finish(&slot, outcome).await;

        tokio::time::sleep(SLOT_RETENTION).await;
        self.runs.write().await.remove(&run_id);
        debug!("Run {} evicted from memory", run_id);
    }

    /// Refresh the run's heartbeat until aborted.
    async fn keep_alive(self: Arc<Self>, run_id: RunId) {
        let mut ticker = tokio::time::interval(self.config.polling.owner_lease() / 3);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.store.touch_run(&run_id, Utc::now()).await {
                warn!("Could not refresh heartbeat of run {}: {}", run_id, e);
            }
        }
    }

    /// Heartbeats older than this mark a run as orphaned.
    fn stale_before(&self) -> SchedResult<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.config.polling.owner_lease())
            .map_err(|e| SchedError::ConfigError(format!("owner lease out of range: {e}")))?;
        Ok(Utc::now() - lease)
    }

    async fn execute(&self, slot: &RunSlot) -> Outcome {
        let (run_id, request, remote_dir) = {
            let record = slot.record.read().await;
            let remote_dir = record
                .remote_dir
                .clone()
                .unwrap_or_else(|| self.config.run_dir(&record.id));
            (record.id, record.request.clone(), remote_dir)
        };

        // Stage the workspace
        if self.cancel_requested(slot, &run_id).await {
            return Outcome::Cancelled("cancelled before staging".to_string());
        }
        if let Err(e) = self
            .advance(slot, RunState::StagingIn, "staging workspace", |_| {})
            .await
        {
            return Outcome::failed(FailureKind::Internal, e.to_string());
        }

        let mut bundle = match self.pack(&request, &run_id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                self.discard_staging(&run_id).await;
                return Outcome::failed(
                    FailureKind::TransferFailed,
                    format!("could not pack workspace: {e}"),
                );
            }
        };
        let staged = match self.pool.acquire().await {
            Ok(session) => {
                self.transfer
                    .stage_out(&session, &mut bundle, &remote_dir)
                    .await
            }
            Err(e) => {
                self.discard_staging(&run_id).await;
                return Outcome::failed(FailureKind::TransferFailed, e.to_string());
            }
        };
        self.discard_staging(&run_id).await;
        if let Some(failure) = staged.failure {
            return Outcome::failed(FailureKind::TransferFailed, failure.to_string());
        }

        // Submit
        if self.cancel_requested(slot, &run_id).await {
            return Outcome::Cancelled("cancelled before submission".to_string());
        }
        let mut job = JobDescriptor::new(&request.workflow_id, &request.workspace_id, &remote_dir)
            .with_bundle_path(staged.remote_path.clone())
            .with_script_path(self.config.script_path(&run_id))
            .with_input(&request.input_file_group, &request.mets_filename);
        if let Some(pages) = request.pages {
            job = job.with_pages(pages);
        }
        if let Some(forks) = request.forks {
            job = job.with_forks(forks);
        }

        let submitted = match self.pool.acquire().await {
            Ok(session) => self.executor.submit(&session, &mut job).await,
            Err(e) => Err(e.into()),
        };
        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(e) => return Outcome::failed(FailureKind::SubmissionFailed, e.to_string()),
        };
        let reason = format!("submitted as SLURM job {job_id}");
        let recorded = job_id.clone();
        if let Err(e) = self
            .advance(slot, RunState::Submitted, reason, move |record| {
                record.scheduler_job_id = Some(recorded);
            })
            .await
        {
            self.cancel_remote(&job_id).await;
            self.executor.release(&job_id);
            return Outcome::failed(FailureKind::Internal, e.to_string());
        }

        self.follow(slot, &run_id, &request, &job_id, &remote_dir)
            .await
    }

    /// Continue a run taken over from a driver that stopped.
    async fn resume(&self, slot: &RunSlot) -> Outcome {
        let (run_id, request, remote_dir, state, job_id) = {
            let record = slot.record.read().await;
            let remote_dir = record
                .remote_dir
                .clone()
                .unwrap_or_else(|| self.config.run_dir(&record.id));
            (
                record.id,
                record.request.clone(),
                remote_dir,
                record.state,
                record.scheduler_job_id.clone(),
            )
        };
        info!("Resuming run {} from {}", run_id, state);

        let Some(job_id) = job_id else {
            if self.cancel_requested(slot, &run_id).await {
                return Outcome::Cancelled(format!("cancelled after its driver stopped in {state}"));
            }
            return Outcome::failed(
                FailureKind::Internal,
                format!("driver stopped in {state} before a job was submitted"),
            );
        };
        self.executor.track(&job_id, &remote_dir);

        match state {
            RunState::Submitted | RunState::Polling => {
                self.follow(slot, &run_id, &request, &job_id, &remote_dir)
                    .await
            }
            RunState::StagingOut => self.retrieve(slot, &run_id, &request, &remote_dir).await,
            other => Outcome::failed(
                FailureKind::Internal,
                format!("cannot resume a run in {other}"),
            ),
        }
    }

    /// Poll a submitted job until it ends, then collect its results.
    async fn follow(
        &self,
        slot: &RunSlot,
        run_id: &RunId,
        request: &RunRequest,
        job_id: &SchedulerJobId,
        remote_dir: &str,
    ) -> Outcome {
        if self.cancel_requested(slot, run_id).await {
            self.cancel_remote(job_id).await;
            return Outcome::Cancelled(format!("cancelled after submitting job {job_id}"));
        }
        if slot.record.read().await.state == RunState::Submitted {
            if let Err(e) = self
                .advance(slot, RunState::Polling, "polling scheduler", |_| {})
                .await
            {
                self.cancel_remote(job_id).await;
                return Outcome::failed(FailureKind::Internal, e.to_string());
            }
        }

        match self.poll_until_done(slot, run_id, job_id).await {
            PollEnd::Succeeded => {}
            PollEnd::RemoteFailed => {
                let log = match self.pool.acquire().await {
                    Ok(session) => self.executor.fetch_log(&session, job_id).await,
                    Err(e) => Err(e.into()),
                };
                let message = match log {
                    Ok(tail) if !tail.trim().is_empty() => {
                        format!("SLURM job {job_id} failed; log tail:\n{}", tail.trim_end())
                    }
                    Ok(_) => format!("SLURM job {job_id} failed; log is empty"),
                    Err(e) => format!("SLURM job {job_id} failed; log unavailable: {e}"),
                };
                return Outcome::failed(FailureKind::RemoteJobFailed, message);
            }
            PollEnd::RemoteCancelled => {
                return Outcome::failed(
                    FailureKind::RemoteJobFailed,
                    format!("SLURM job {job_id} was cancelled on the cluster"),
                );
            }
            PollEnd::TimedOut => {
                self.cancel_remote(job_id).await;
                return Outcome::failed(
                    FailureKind::Timeout,
                    format!(
                        "SLURM job {} did not finish within {}s",
                        job_id, self.config.polling.max_run_secs
                    ),
                );
            }
            PollEnd::Unavailable(message) => {
                self.cancel_remote(job_id).await;
                return Outcome::failed(FailureKind::StatusUnavailable, message);
            }
            PollEnd::CancelRequested => {
                self.cancel_remote(job_id).await;
                return Outcome::Cancelled(format!("cancelled while job {job_id} was active"));
            }
        }

        self.retrieve(slot, run_id, request, remote_dir).await
    }

    /// Download and unpack the result archive of a finished job.
    async fn retrieve(
        &self,
        slot: &RunSlot,
        run_id: &RunId,
        request: &RunRequest,
        remote_dir: &str,
    ) -> Outcome {
        if self.cancel_requested(slot, run_id).await {
            return Outcome::Cancelled("cancelled before result retrieval".to_string());
        }
        if slot.record.read().await.state != RunState::StagingOut {
            if let Err(e) = self
                .advance(slot, RunState::StagingOut, "retrieving results", |_| {})
                .await
            {
                return Outcome::failed(FailureKind::Internal, e.to_string());
            }
        }

        let output_dir = self.config.run_output_dir(run_id);
        let archive = output_dir.join(OUTPUT_ARCHIVE);
        let remote_archive = format!("{}/{}", remote_dir, OUTPUT_ARCHIVE);
        let retrieved = match self.pool.acquire().await {
            Ok(session) => {
                self.transfer
                    .stage_in(&session, &remote_archive, &archive)
                    .await
            }
            Err(e) => return Outcome::failed(FailureKind::ResultRetrievalFailed, e.to_string()),
        };
        if let Some(failure) = retrieved.failure {
            return Outcome::failed(FailureKind::ResultRetrievalFailed, failure.to_string());
        }

        let dest = output_dir.clone();
        let source = archive.clone();
        let unpacked = tokio::task::spawn_blocking(move || unpack_archive(&source, &dest))
            .await
            .map_err(SchedError::from)
            .and_then(|result| result);
        if let Err(e) = unpacked {
            return Outcome::failed(
                FailureKind::ResultRetrievalFailed,
                format!("could not unpack results: {e}"),
            );
        }
        if let Err(e) = tokio::fs::remove_file(&archive).await {
            debug!("Could not remove {}: {}", archive.display(), e);
        }

        Outcome::Done(output_dir.join(&request.workspace_id))
    }

    async fn poll_until_done(
        &self,
        slot: &RunSlot,
        run_id: &RunId,
        job_id: &SchedulerJobId,
    ) -> PollEnd {
        let polling = &self.config.polling;
        let deadline = Instant::now() + polling.max_run_duration();
        let mut interval = polling.interval_min();
        let mut last: Option<JobStatus> = None;
        let mut unknown = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return PollEnd::TimedOut;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
                _ = slot.wake.notified() => {}
            }
            if self.cancel_requested(slot, run_id).await {
                return PollEnd::CancelRequested;
            }
            if Instant::now() >= deadline {
                return PollEnd::TimedOut;
            }

            let polled = match self.pool.acquire().await {
                Ok(session) => self.executor.poll(&session, job_id).await,
                Err(e) => Err(e.into()),
            };
            let status = match polled {
                Ok(status) => status,
                Err(SchedError::SlurmJobNotFound(_)) => {
                    return PollEnd::Unavailable(format!(
                        "SLURM job {job_id} is known to neither squeue nor sacct"
                    ));
                }
                Err(e) => {
                    warn!("Polling SLURM job {} failed: {}", job_id, e);
                    JobStatus::Unknown
                }
            };

            if status == JobStatus::Unknown {
                unknown += 1;
                debug!(
                    "SLURM job {} state unknown ({}/{})",
                    job_id, unknown, polling.max_unknown_polls
                );
                if unknown > polling.max_unknown_polls {
                    return PollEnd::Unavailable(format!(
                        "state of SLURM job {job_id} unknown for {unknown} consecutive polls"
                    ));
                }
                interval = polling.next_interval(interval);
                continue;
            }
            unknown = 0;

            if last != Some(status) {
                info!("SLURM job {} is {}", job_id, status);
                self.note_job_status(slot, status).await;
                last = Some(status);
                interval = polling.interval_min();
            } else {
                interval = polling.next_interval(interval);
            }

            match status {
                JobStatus::Succeeded => return PollEnd::Succeeded,
                JobStatus::Failed => return PollEnd::RemoteFailed,
                JobStatus::Cancelled => return PollEnd::RemoteCancelled,
                _ => {}
            }
        }
    }

    /// Apply a transition, persist it, then publish it.
    async fn advance(
        &self,
        slot: &RunSlot,
        to: RunState,
        reason: impl Into<String>,
        update: impl FnOnce(&mut RunRecord),
    ) -> SchedResult<()> {
        let mut next = slot.record.read().await.clone();
        update(&mut next);
        next.heartbeat_at = Some(Utc::now());
        let from = next.state;
        next.transition(to, reason)?;
        self.store.save_run(&next).await?;
        info!("Run {}: {} -> {}", next.id, from, to);
        *slot.record.write().await = next;
        slot.state.send_replace(to);
        Ok(())
    }

    async fn note_job_status(&self, slot: &RunSlot, status: JobStatus) {
        let mut next = slot.record.read().await.clone();
        next.job_status = Some(status);
        next.updated_at = Utc::now();
        next.heartbeat_at = Some(next.updated_at);
        if let Err(e) = self.store.save_run(&next).await {
            warn!("Could not persist job status of run {}: {}", next.id, e);
        }
        *slot.record.write().await = next;
    }

    async fn finish(&self, slot: &RunSlot, outcome: Outcome) {
        let mut next = slot.record.read().await.clone();
        let result = match outcome {
            Outcome::Done(output) => {
                next.output = Some(output);
                next.transition(RunState::Done, "results retrieved")
            }
            Outcome::Failed(reason) => next.fail(reason),
            Outcome::Cancelled(note) => next.transition(RunState::Cancelled, note),
        };
        if let Err(e) = result {
            error!("Run {} could not reach a terminal state: {}", next.id, e);
            if !next.state.is_terminal() {
                next.output = None;
                let _ = next.fail(FailureReason::new(FailureKind::Internal, e.to_string()));
            }
        }

        if let Err(e) = self.store.save_run(&next).await {
            error!("Could not persist final state of run {}: {}", next.id, e);
        }
        if let Err(e) = self
            .workspaces
            .record_outcome(
                &next.request.workspace_id,
                &next.id,
                next.state,
                next.output.as_deref(),
            )
            .await
        {
            warn!(
                "Could not record outcome on workspace {}: {}",
                next.request.workspace_id, e
            );
        }

        match (&next.state, &next.failure) {
            (RunState::Failed, Some(reason)) => warn!("Run {} failed: {}", next.id, reason),
            (state, _) => info!("Run {} finished: {}", next.id, state),
        }

        let state = next.state;
        *slot.record.write().await = next;
        slot.state.send_replace(state);
    }

    /// Whether cancellation was requested here or through the store.
    async fn cancel_requested(&self, slot: &RunSlot, run_id: &RunId) -> bool {
        if slot.cancel.load(Ordering::SeqCst) {
            return true;
        }
        match self.store.is_cancel_requested(run_id).await {
            Ok(true) => {
                info!("Run {} was cancelled through the run store", run_id);
                slot.cancel.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!("Could not read cancel flag of run {}: {}", run_id, e);
                false
            }
        }
    }

    async fn pack(&self, request: &RunRequest, run_id: &RunId) -> SchedResult<WorkspaceBundle> {
        let workspace_dir = self
            .workspaces
            .workspace_path(&request.workspace_id)
            .await?;
        let template = self.config.workflow_script(&request.workflow_id);
        let script_name = format!("{}.nf", request.workflow_id);
        let staging = self.config.staging_dir.join(run_id.to_string());
        let id = request.workspace_id.clone();

        tokio::task::spawn_blocking(move || {
            WorkspaceBundle::pack(
                &id,
                &workspace_dir,
                Some((script_name.as_str(), template.as_path())),
                &staging,
            )
        })
        .await?
    }

    async fn discard_staging(&self, run_id: &RunId) {
        let staging = self.config.staging_dir.join(run_id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove {}: {}", staging.display(), e);
            }
        }
    }

    /// Best-effort `scancel`; failures are logged.
    async fn cancel_remote(&self, job_id: &SchedulerJobId) {
        let cancelled = match self.pool.acquire().await {
            Ok(session) => self.executor.cancel(&session, job_id).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = cancelled {
            warn!("Could not cancel SLURM job {}: {}", job_id, e);
        }
    }
}
