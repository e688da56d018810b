//! Run lifecycle types: the caller-visible state machine and its history.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{SchedError, SchedResult};
use crate::job::{JobStatus, SchedulerJobId};

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    Created,
    /// Workspace bundle is being uploaded to the cluster.
    StagingIn,
    Submitted,
    Polling,
    /// Results are being retrieved from the cluster.
    StagingOut,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed | Cancelled) => true,
            (Created, StagingIn)
            | (StagingIn, Submitted)
            | (Submitted, Polling)
            | (Polling, StagingOut)
            | (StagingOut, Done) => true,
            _ => false,
        }
    }

    /// Get the state name.
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Created => "CREATED",
            RunState::StagingIn => "STAGING_IN",
            RunState::Submitted => "SUBMITTED",
            RunState::Polling => "POLLING",
            RunState::StagingOut => "STAGING_OUT",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
            RunState::Cancelled => "CANCELLED",
        }
    }

    /// Parse a state name as produced by [`RunState::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        let state = match name {
            "CREATED" => RunState::Created,
            "STAGING_IN" => RunState::StagingIn,
            "SUBMITTED" => RunState::Submitted,
            "POLLING" => RunState::Polling,
            "STAGING_OUT" => RunState::StagingOut,
            "DONE" => RunState::Done,
            "FAILED" => RunState::Failed,
            "CANCELLED" => RunState::Cancelled,
            _ => return None,
        };
        Some(state)
    }

    /// All non-terminal states.
    pub fn active() -> [RunState; 5] {
        [
            RunState::Created,
            RunState::StagingIn,
            RunState::Submitted,
            RunState::Polling,
            RunState::StagingOut,
        ]
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Workspace could not be packed or staged to the cluster.
    TransferFailed,
    /// The scheduler rejected the job or never acknowledged it.
    SubmissionFailed,
    /// The wall-clock budget ran out before the job finished.
    Timeout,
    /// The batch job itself failed.
    RemoteJobFailed,
    /// The job succeeded but its results could not be retrieved.
    ResultRetrievalFailed,
    /// The job's state could not be determined.
    StatusUnavailable,
    Internal,
}

impl FailureKind {
    /// Failures caused by infrastructure rather than by the workflow or the request.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FailureKind::TransferFailed
                | FailureKind::Timeout
                | FailureKind::ResultRetrievalFailed
                | FailureKind::StatusUnavailable
                | FailureKind::Internal
        )
    }

    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::TransferFailed => "TRANSFER_FAILED",
            FailureKind::SubmissionFailed => "SUBMISSION_FAILED",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::RemoteJobFailed => "REMOTE_JOB_FAILED",
            FailureKind::ResultRetrievalFailed => "RESULT_RETRIEVAL_FAILED",
            FailureKind::StatusUnavailable => "STATUS_UNAVAILABLE",
            FailureKind::Internal => "INTERNAL",
        }
    }
}

/// Structured failure reason attached to a FAILED run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        self.kind.is_infrastructure()
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

/// One entry in a run's append-only history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State before the transition; `None` for the creating entry.
    pub from: Option<RunState>,
    pub to: RunState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// What the caller asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub workflow_id: String,
    pub workspace_id: String,
    pub input_file_group: String,
    pub mets_filename: String,
    /// Page count of the workspace, used to clamp forks.
    pub pages: Option<u32>,
    pub forks: Option<u32>,
}

impl RunRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        workspace_id: impl Into<String>,
        input_file_group: impl Into<String>,
        mets_filename: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workspace_id: workspace_id.into(),
            input_file_group: input_file_group.into(),
            mets_filename: mets_filename.into(),
            pages: None,
            forks: None,
        }
    }

    pub fn with_pages(mut self, pages: u32) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_forks(mut self, forks: u32) -> Self {
        self.forks = Some(forks);
        self
    }

    /// Reject requests with empty identifiers.
    pub fn validate(&self) -> SchedResult<()> {
        for (field, value) in [
            ("workflow_id", &self.workflow_id),
            ("workspace_id", &self.workspace_id),
            ("input_file_group", &self.input_file_group),
            ("mets_filename", &self.mets_filename),
        ] {
            if value.trim().is_empty() {
                return Err(SchedError::ConfigError(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

/// Durable record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub request: RunRequest,
    pub state: RunState,
    pub failure: Option<FailureReason>,
    pub history: Vec<Transition>,
    pub scheduler_job_id: Option<SchedulerJobId>,
    /// Last status reported by the scheduler.
    pub job_status: Option<JobStatus>,
    pub remote_dir: Option<String>,
    /// Local directory holding the retrieved results.
    pub output: Option<PathBuf>,
    pub cancel_requested: bool,
    /// Last time the process driving this run reported in.
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a record in the CREATED state.
    pub fn new(request: RunRequest) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            request,
            state: RunState::Created,
            failure: None,
            history: vec![Transition {
                from: None,
                to: RunState::Created,
                at: now,
                reason: "run created".to_string(),
            }],
            scheduler_job_id: None,
            job_status: None,
            remote_dir: None,
            output: None,
            cancel_requested: false,
            heartbeat_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, appending to the history.
    pub fn transition(&mut self, to: RunState, reason: impl Into<String>) -> SchedResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(SchedError::InvalidJobState {
                expected: format!("a state that can move to {to}"),
                found: self.state.to_string(),
            });
        }
        let now = Utc::now();
        self.history.push(Transition {
            from: Some(self.state),
            to,
            at: now,
            reason: reason.into(),
        });
        self.state = to;
        self.updated_at = now;
        Ok(())
    }

    /// Move to FAILED with a structured reason.
    pub fn fail(&mut self, reason: FailureReason) -> SchedResult<()> {
        self.transition(RunState::Failed, reason.to_string())?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Whether this run is still active but its driver has gone quiet for
    /// longer than `lease`.
    pub fn is_orphaned(&self, lease: Duration, now: DateTime<Utc>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let Ok(lease) = chrono::Duration::from_std(lease) else {
            return false;
        };
        self.heartbeat_at.is_none_or(|at| now - at > lease)
    }

    /// Caller-visible view of this record.
    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.id,
            workflow_id: self.request.workflow_id.clone(),
            workspace_id: self.request.workspace_id.clone(),
            state: self.state,
            reason: self.failure.clone(),
            scheduler_job_id: self.scheduler_job_id.clone(),
            job_status: self.job_status,
            output: self.output.clone(),
            cancel_requested: self.cancel_requested,
            history: self.history.clone(),
        }
    }
}

/// Status of a run as returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workspace_id: String,
    pub state: RunState,
    pub reason: Option<FailureReason>,
    pub scheduler_job_id: Option<SchedulerJobId>,
    pub job_status: Option<JobStatus>,
    pub output: Option<PathBuf>,
    pub cancel_requested: bool,
    pub history: Vec<Transition>,
}

/// Filter for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to these states.
    pub states: Option<Vec<RunState>>,
    pub workspace_id: Option<String>,
    /// Maximum number of runs, newest first.
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn active() -> Self {
        Self {
            states: Some(RunState::active().to_vec()),
            ..Self::default()
        }
    }

    pub fn with_workspace(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
