//! End-to-end run scenarios against a scripted cluster.
//!
//! Every test drives the real orchestrator, transfer manager and SLURM
//! executor over a `MockRemote`, with SQLite held in memory. Time is paused
//! so backoff and polling intervals elapse instantly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hpcflow_remote::{CommandOutput, MockRemote, SessionConfig, SessionPool};
use hpcflow_sched::{
    FailureKind, Orchestrator, OrchestratorConfig, PollConfig, RetryPolicy, RunFilter, RunId,
    RunRecord, RunRequest, RunState, RunStatus, RunStore, SchedError, SchedulerJobId,
    SlurmConfig, SlurmExecutor, SqliteStore, TransferConfig, TransferManager, WorkspaceBundle,
};
use tempfile::TempDir;

const REMOTE_ROOT: &str = "/scratch/hpcflow";
const WORKFLOW: &str = "wf-ocr-default";
const WORKSPACE: &str = "ws-1";
const INPUT_GROUP: &str = "OCR-D-IMG";
const METS: &str = "mets.xml";

const SQUEUE_HEADER: &str = "JOBID|NAME|STATE|REASON\n";
const SACCT_HEADER: &str = "JobID|JobName|State|ExitCode\n";

struct Harness {
    dir: TempDir,
    remote: MockRemote,
    store: Arc<SqliteStore>,
    orchestrator: Orchestrator,
}

struct Options {
    polling: PollConfig,
    max_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            polling: PollConfig::default(),
            max_attempts: 5,
        }
    }
}

async fn harness(options: Options) -> Harness {
    let dir = tempfile::tempdir().unwrap();

    let workspace = dir.path().join("workspaces").join(WORKSPACE);
    std::fs::create_dir_all(workspace.join("OCR-D-IMG")).unwrap();
    std::fs::write(workspace.join("mets.xml"), "<mets:mets/>").unwrap();
    std::fs::write(workspace.join("OCR-D-IMG").join("0001.tif"), vec![1u8; 512]).unwrap();

    let templates = dir.path().join("workflows");
    std::fs::create_dir_all(&templates).unwrap();
    std::fs::write(
        templates.join(format!("{WORKFLOW}.nf")),
        "nextflow.enable.dsl = 2\n",
    )
    .unwrap();

    let store = Arc::new(SqliteStore::in_memory().unwrap());
    store.register_workspace(WORKSPACE, &workspace).await.unwrap();

    let remote = MockRemote::new();
    let pool = SessionPool::with_connector(remote.connector(), SessionConfig::default(), 2);
    let transfer = TransferManager::new(TransferConfig {
        retry: RetryPolicy::default().with_max_attempts(options.max_attempts),
        ..TransferConfig::default()
    });
    let executor = SlurmExecutor::new(SlurmConfig::default(), RetryPolicy::default());

    let config = OrchestratorConfig::new(
        REMOTE_ROOT,
        templates,
        dir.path().join("staging"),
        dir.path().join("output"),
    )
    .with_polling(options.polling);

    let orchestrator = Orchestrator::new(
        config,
        pool,
        transfer,
        Arc::new(executor),
        store.clone(),
        store.clone(),
    );

    Harness {
        dir,
        remote,
        store,
        orchestrator,
    }
}

impl Harness {
    async fn submit(&self) -> RunId {
        self.orchestrator
            .submit_run(WORKFLOW, WORKSPACE, INPUT_GROUP, METS)
            .await
            .unwrap()
    }

    /// Place a result archive where the batch job of `run_id` would leave it.
    fn stage_result(&self, run_id: &RunId) {
        let result = self.dir.path().join("result").join(WORKSPACE);
        std::fs::create_dir_all(result.join("OCR-D-OCR")).unwrap();
        std::fs::write(result.join("mets.xml"), "<mets:mets processed/>").unwrap();
        std::fs::write(result.join("OCR-D-OCR").join("0001.xml"), "<pc:PcGts/>").unwrap();

        let bundle = WorkspaceBundle::pack(
            WORKSPACE,
            &result,
            None,
            &self.dir.path().join("result-staging"),
        )
        .unwrap();
        let bytes = std::fs::read(bundle.local_path()).unwrap();
        self.remote.put_file(&output_path(run_id), bytes);
    }

    /// A second orchestrator over the same store and cluster, as another
    /// process would run it.
    fn peer(&self) -> Orchestrator {
        Orchestrator::new(
            self.orchestrator.config().clone(),
            SessionPool::with_connector(self.remote.connector(), SessionConfig::default(), 1),
            TransferManager::new(TransferConfig::default()),
            Arc::new(SlurmExecutor::new(
                SlurmConfig::default(),
                RetryPolicy::default(),
            )),
            self.store.clone(),
            self.store.clone(),
        )
    }

    /// Persist a run that a process which died a day ago left in `state`.
    /// Runs past submission carry SLURM job 12345.
    async fn orphan(&self, state: RunState) -> RunId {
        let mut record = RunRecord::new(RunRequest::new(WORKFLOW, WORKSPACE, INPUT_GROUP, METS));
        record.remote_dir = Some(run_dir(&record.id));
        for next in [
            RunState::StagingIn,
            RunState::Submitted,
            RunState::Polling,
            RunState::StagingOut,
        ] {
            if next == RunState::Submitted {
                record.scheduler_job_id = Some(SchedulerJobId::new("12345"));
            }
            record.transition(next, "driven by another process").unwrap();
            if next == state {
                break;
            }
        }
        record.heartbeat_at = Some(Utc::now() - chrono::Duration::days(1));
        self.store.save_run(&record).await.unwrap();
        record.id
    }

    async fn wait_for_state(&self, run_id: &RunId, state: RunState) -> RunStatus {
        loop {
            let status = self.orchestrator.get_run_status(run_id).await.unwrap();
            if status.state == state {
                return status;
            }
            assert!(!status.state.is_terminal(), "run ended in {}", status.state);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

fn run_dir(run_id: &RunId) -> String {
    format!("{REMOTE_ROOT}/slurm_workspaces/{run_id}")
}

fn output_path(run_id: &RunId) -> String {
    format!("{}/output.tar.gz", run_dir(run_id))
}

fn squeue(state: &str) -> String {
    format!("{SQUEUE_HEADER}12345|{WORKFLOW}-{WORKSPACE}|{state}|None\n")
}

fn sacct(state: &str) -> String {
    format!(
        "{SACCT_HEADER}12345|{WORKFLOW}-{WORKSPACE}|{state}|0:0\n12345.batch|batch|{state}|0:0\n"
    )
}

fn job_gone() -> CommandOutput {
    CommandOutput::failed(1, "slurm_load_jobs error: Invalid job id specified\n")
}

fn states(status: &RunStatus) -> Vec<RunState> {
    status.history.iter().map(|t| t.to).collect()
}

fn script_successful_job(remote: &MockRemote) {
    remote.respond("sbatch", "Submitted batch job 12345\n");
    remote.respond("squeue", &squeue("PENDING"));
    remote.respond("squeue", &squeue("PENDING"));
    remote.respond("squeue", &squeue("RUNNING"));
    remote.respond_output("squeue", job_gone());
    remote.respond("sacct", &sacct("COMPLETED"));
}

#[tokio::test(start_paused = true)]
async fn test_run_completes_and_retrieves_results() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);

    let run_id = h.submit().await;
    h.stage_result(&run_id);

    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done, "{:?}", status.reason);
    assert!(status.reason.is_none());
    assert_eq!(
        states(&status),
        vec![
            RunState::Created,
            RunState::StagingIn,
            RunState::Submitted,
            RunState::Polling,
            RunState::StagingOut,
            RunState::Done,
        ]
    );
    assert_eq!(status.scheduler_job_id.unwrap().as_str(), "12345");

    let output = status.output.unwrap();
    assert_eq!(
        output,
        h.dir
            .path()
            .join("output")
            .join(run_id.to_string())
            .join(WORKSPACE)
    );
    assert_eq!(
        std::fs::read_to_string(output.join("OCR-D-OCR").join("0001.xml")).unwrap(),
        "<pc:PcGts/>"
    );

    // Bundle and script landed under their final names; nothing half-written.
    let files = h.remote.files();
    assert!(files.contains(&format!("{}/{WORKSPACE}.tar.gz", run_dir(&run_id))));
    assert!(files.contains(&format!("{REMOTE_ROOT}/batch_scripts/{run_id}.sh")));
    assert!(files.iter().all(|f| !f.ends_with(".partial")));
    assert_eq!(h.remote.count_commands("sbatch"), 1);

    // Local staging is cleaned up.
    assert!(!h.dir.path().join("staging").join(run_id.to_string()).exists());

    let (ws_status, ws_result) = h.store.workspace_outcome(WORKSPACE).await.unwrap().unwrap();
    assert_eq!(ws_status.as_deref(), Some("DONE"));
    assert_eq!(ws_result, Some(output));

    // Persisted as well.
    let stored = h.store.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_upload_recovers_from_dropped_connections() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);
    h.remote.fail_next_uploads(2);

    let run_id = h.submit().await;
    h.stage_result(&run_id);

    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done, "{:?}", status.reason);
}

#[tokio::test(start_paused = true)]
async fn test_upload_exhaustion_fails_run() {
    let h = harness(Options {
        max_attempts: 4,
        ..Options::default()
    })
    .await;
    script_successful_job(&h.remote);
    h.remote.fail_next_uploads(4);

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::TransferFailed);
    assert!(reason.message.contains("4 attempt"), "{}", reason.message);
    assert_eq!(h.remote.count_commands("sbatch"), 0);
    assert!(h.remote.files().iter().all(|f| !f.ends_with(".partial")));

    let (ws_status, ws_result) = h.store.workspace_outcome(WORKSPACE).await.unwrap().unwrap();
    assert_eq!(ws_status.as_deref(), Some("FAILED"));
    assert_eq!(ws_result, None);
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_upload_is_not_retried() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);
    h.remote.corrupt_next_uploads(1);

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::TransferFailed);
    assert!(reason.message.contains("corruption"), "{}", reason.message);
    assert_eq!(h.remote.count_commands("sha256sum"), 1);
    assert_eq!(h.remote.count_commands("sbatch"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_unknown_status_is_tolerated() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    for _ in 0..3 {
        h.remote.respond("squeue", SQUEUE_HEADER);
        h.remote.respond("sacct", SACCT_HEADER);
    }
    h.remote.respond("squeue", &squeue("RUNNING"));
    h.remote.respond_output("squeue", job_gone());
    h.remote.respond("sacct", &sacct("COMPLETED"));

    let run_id = h.submit().await;
    h.stage_result(&run_id);

    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done, "{:?}", status.reason);
    assert_eq!(h.remote.count_commands("squeue"), 5);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_unknown_status_fails_run() {
    let h = harness(Options {
        polling: PollConfig {
            max_unknown_polls: 2,
            ..PollConfig::default()
        },
        ..Options::default()
    })
    .await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond("squeue", SQUEUE_HEADER);
    h.remote.respond("sacct", SACCT_HEADER);

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.reason.unwrap().kind, FailureKind::StatusUnavailable);
    assert_eq!(h.remote.count_commands("squeue"), 3);
    assert_eq!(h.remote.count_commands("scancel"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_remote_job_once() {
    let h = harness(Options {
        polling: PollConfig {
            max_run_secs: 600,
            ..PollConfig::default()
        },
        ..Options::default()
    })
    .await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond("squeue", &squeue("RUNNING"));

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.reason.unwrap().kind, FailureKind::Timeout);
    assert_eq!(h.remote.count_commands("scancel 12345"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_failure_reports_log_tail() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond_output("squeue", job_gone());
    h.remote.respond("sacct", &sacct("FAILED"));
    h.remote
        .respond("tail", "ERROR ~ Error executing process > 'ocrd_tesserocr'\n");

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::RemoteJobFailed);
    assert!(!reason.is_infrastructure());
    assert!(reason.message.contains("ocrd_tesserocr"), "{}", reason.message);
    assert_eq!(h.remote.count_commands("scancel"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submission_fails_run() {
    let h = harness(Options::default()).await;
    h.remote.respond_output(
        "sbatch",
        CommandOutput::failed(1, "sbatch: error: Invalid qos specification\n"),
    );

    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::SubmissionFailed);
    assert!(reason.message.contains("Invalid qos"), "{}", reason.message);
    assert_eq!(h.remote.count_commands("sbatch"), 1);
    assert!(status.scheduler_job_id.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_is_idempotent() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond("squeue", &squeue("RUNNING"));

    let run_id = h.submit().await;
    h.wait_for_state(&run_id, RunState::Polling).await;

    h.orchestrator.cancel_run(&run_id).await.unwrap();
    h.orchestrator.cancel_run(&run_id).await.unwrap();
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert!(status.reason.is_none());

    // Cancelling a finished run changes nothing.
    h.orchestrator.cancel_run(&run_id).await.unwrap();
    let again = h.orchestrator.get_run_status(&run_id).await.unwrap();
    assert_eq!(again.state, RunState::Cancelled);
    assert_eq!(again.history.len(), status.history.len());
    assert_eq!(h.remote.count_commands("scancel 12345"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_done_is_a_no_op() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);

    let run_id = h.submit().await;
    h.stage_result(&run_id);
    let done = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(done.state, RunState::Done);

    h.orchestrator.cancel_run(&run_id).await.unwrap();
    let status = h.orchestrator.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done);
    assert_eq!(status.output, done.output);
    assert_eq!(h.remote.count_commands("scancel"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_through_store_is_honoured() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond("squeue", &squeue("RUNNING"));

    let run_id = h.submit().await;
    h.wait_for_state(&run_id, RunState::Polling).await;

    // Another process flags the run.
    assert!(h.store.request_cancel(&run_id).await.unwrap());

    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert_eq!(h.remote.count_commands("scancel 12345"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_runs_get_distinct_jobs() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 100\n");
    h.remote.respond("sbatch", "Submitted batch job 101\n");
    h.remote
        .respond("squeue", &format!("{SQUEUE_HEADER}100|job|RUNNING|None\n"));

    let request = RunRequest::new(WORKFLOW, WORKSPACE, INPUT_GROUP, METS)
        .with_pages(12)
        .with_forks(4);
    let first = h.orchestrator.submit_request(request.clone()).await.unwrap();
    let second = h.orchestrator.submit_request(request).await.unwrap();
    assert_ne!(first, second);

    let a = h.wait_for_state(&first, RunState::Polling).await;
    let b = h.wait_for_state(&second, RunState::Polling).await;
    let mut ids = vec![
        a.scheduler_job_id.unwrap().to_string(),
        b.scheduler_job_id.unwrap().to_string(),
    ];
    ids.sort();
    assert_eq!(ids, vec!["100", "101"]);
    assert_eq!(h.remote.count_commands("sbatch"), 2);

    let active = h.orchestrator.list_runs(&RunFilter::active()).await.unwrap();
    assert_eq!(active.len(), 2);

    h.orchestrator.cancel_run(&first).await.unwrap();
    h.orchestrator.cancel_run(&second).await.unwrap();
    for run_id in [first, second] {
        let status = h.orchestrator.wait_run(&run_id).await.unwrap();
        assert_eq!(status.state, RunState::Cancelled);
    }
    assert!(
        h.orchestrator
            .list_runs(&RunFilter::active())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_unknown_workspace_or_workflow_is_rejected() {
    let h = harness(Options::default()).await;

    let err = h
        .orchestrator
        .submit_run(WORKFLOW, "ws-missing", INPUT_GROUP, METS)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::WorkspaceNotFound(_)), "{err}");

    let err = h
        .orchestrator
        .submit_run("wf-missing", WORKSPACE, INPUT_GROUP, METS)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::ConfigError(_)), "{err}");

    let err = h
        .orchestrator
        .submit_run("", WORKSPACE, INPUT_GROUP, METS)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedError::ConfigError(_)), "{err}");

    assert!(
        h.store
            .list_runs(&RunFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    assert!(h.remote.commands().is_empty());
}

#[tokio::test]
async fn test_unknown_run_id() {
    let h = harness(Options::default()).await;
    let run_id = RunId::new();

    assert!(matches!(
        h.orchestrator.get_run_status(&run_id).await,
        Err(SchedError::RunNotFound(_))
    ));
    assert!(matches!(
        h.orchestrator.cancel_run(&run_id).await,
        Err(SchedError::RunNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_runs_survive_in_store() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);

    let run_id = h.submit().await;
    h.stage_result(&run_id);
    h.orchestrator.wait_run(&run_id).await.unwrap();

    // A second orchestrator over the same store sees the finished run.
    let other = h.peer();
    let status = other.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done);
    assert!(status.output.as_deref().is_some_and(Path::exists));
    assert_eq!(other.wait_run(&run_id).await.unwrap().state, RunState::Done);
    other.cancel_run(&run_id).await.unwrap();

    let listed = other
        .list_runs(&RunFilter::default().with_workspace(WORKSPACE))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_id, run_id);

    h.orchestrator.shutdown().await;
    other.shutdown().await;
}


#[tokio::test(start_paused = true)]
async fn test_missing_result_archive_fails_retrieval() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);

    // The job succeeds but never writes its archive.
    let run_id = h.submit().await;
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    assert_eq!(
        states(&status),
        vec![
            RunState::Created,
            RunState::StagingIn,
            RunState::Submitted,
            RunState::Polling,
            RunState::StagingOut,
            RunState::Failed,
        ]
    );
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::ResultRetrievalFailed);
    assert!(reason.is_infrastructure());
    assert!(status.output.is_none());

    let local = h.dir.path().join("output").join(run_id.to_string());
    assert!(!local.join("output.tar.gz").exists());
    assert!(!local.join(WORKSPACE).exists());
    assert_eq!(h.remote.count_commands("scancel"), 0);

    let (ws_status, ws_result) = h.store.workspace_outcome(WORKSPACE).await.unwrap().unwrap();
    assert_eq!(ws_status.as_deref(), Some("FAILED"));
    assert_eq!(ws_result, None);
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_result_download_fails_retrieval() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);
    h.remote.corrupt_next_downloads(1);

    let run_id = h.submit().await;
    h.stage_result(&run_id);
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Failed);
    let reason = status.reason.unwrap();
    assert_eq!(reason.kind, FailureKind::ResultRetrievalFailed);
    assert!(reason.message.contains("corruption"), "{}", reason.message);
    assert!(status.output.is_none());

    let local = h.dir.path().join("output").join(run_id.to_string());
    assert!(!local.join("output.tar.gz").exists());
    assert!(!local.join("output.tar.gz.partial").exists());
    assert!(!local.join(WORKSPACE).exists());
    // One digest for the staged bundle, one for the result; no retry.
    assert_eq!(h.remote.count_commands("sha256sum"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_orphaned_run_cancels_its_job() {
    let h = harness(Options::default()).await;
    h.remote.respond("squeue", &squeue("RUNNING"));
    let run_id = h.orphan(RunState::Polling).await;

    h.orchestrator.cancel_run(&run_id).await.unwrap();
    let status = tokio::time::timeout(
        Duration::from_secs(7 * 24 * 3600),
        h.orchestrator.wait_run(&run_id),
    )
    .await
    .expect("orphaned run never finished")
    .unwrap();

    assert_eq!(status.state, RunState::Cancelled);
    assert!(status.cancel_requested);
    assert_eq!(h.remote.count_commands("scancel 12345"), 1);
    assert_eq!(h.remote.count_commands("sbatch"), 0);

    let stored = h.store.load_run(&run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Cancelled);
    let (ws_status, _) = h.store.workspace_outcome(WORKSPACE).await.unwrap().unwrap();
    assert_eq!(ws_status.as_deref(), Some("CANCELLED"));

    // Cancelling again changes nothing.
    h.orchestrator.cancel_run(&run_id).await.unwrap();
    assert_eq!(h.remote.count_commands("scancel"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_on_orphaned_run_resumes_polling() {
    let h = harness(Options::default()).await;
    h.remote.respond_output("squeue", job_gone());
    h.remote.respond("sacct", &sacct("COMPLETED"));
    let run_id = h.orphan(RunState::Polling).await;
    h.stage_result(&run_id);

    let status = h.orchestrator.wait_run(&run_id).await.unwrap();

    assert_eq!(status.state, RunState::Done, "{:?}", status.reason);
    assert_eq!(status.scheduler_job_id.as_ref().unwrap().as_str(), "12345");
    assert_eq!(
        &states(&status)[3..],
        &[RunState::Polling, RunState::StagingOut, RunState::Done]
    );
    let output = status.output.unwrap();
    assert_eq!(
        std::fs::read_to_string(output.join("OCR-D-OCR").join("0001.xml")).unwrap(),
        "<pc:PcGts/>"
    );
    assert_eq!(h.remote.count_commands("sbatch"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recover_takes_over_only_orphaned_runs() {
    let h = harness(Options::default()).await;
    h.remote.respond("sbatch", "Submitted batch job 12345\n");
    h.remote.respond("squeue", &squeue("RUNNING"));

    let live = h.submit().await;
    h.wait_for_state(&live, RunState::Polling).await;
    let lost = h.orphan(RunState::StagingIn).await;

    let other = h.peer();
    assert_eq!(other.recover().await.unwrap(), vec![lost]);
    assert!(other.recover().await.unwrap().is_empty());
    assert!(!other.is_driving(&live).await);

    // Lost before anything reached the scheduler.
    let status = other.wait_run(&lost).await.unwrap();
    assert_eq!(status.state, RunState::Failed);
    assert_eq!(status.reason.unwrap().kind, FailureKind::Internal);
    assert!(status.scheduler_job_id.is_none());

    h.orchestrator.cancel_run(&live).await.unwrap();
    let status = h.orchestrator.wait_run(&live).await.unwrap();
    assert_eq!(status.state, RunState::Cancelled);
    assert_eq!(h.remote.count_commands("scancel 12345"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_finished_runs_leave_memory() {
    let h = harness(Options::default()).await;
    script_successful_job(&h.remote);

    let run_id = h.submit().await;
    h.stage_result(&run_id);
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done);
    assert!(h.orchestrator.is_driving(&run_id).await);

    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(!h.orchestrator.is_driving(&run_id).await);

    // The store still answers for it.
    let status = h.orchestrator.get_run_status(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done);
    assert!(status.output.is_some());
    let status = h.orchestrator.wait_run(&run_id).await.unwrap();
    assert_eq!(status.state, RunState::Done);
}
