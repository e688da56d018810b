//! Batch-job types for the SLURM executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

/// File name of the result archive the batch script leaves in the run directory.
pub const OUTPUT_ARCHIVE: &str = "output.tar.gz";

/// Input file group used when a run names none.
pub const DEFAULT_INPUT_FILE_GROUP: &str = "DEFAULT";

/// METS file name used when a run names none.
pub const DEFAULT_METS_FILENAME: &str = "mets.xml";

/// Identifier assigned by the remote scheduler on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchedulerJobId(pub String);

impl SchedulerJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SchedulerJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical state of a batch job, independent of the scheduler's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// The poll could not determine the state. Never terminal.
    Unknown,
}

impl JobStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Get the status name.
    pub fn name(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to submit one workflow execution as a batch job.
///
/// A descriptor receives a scheduler job id exactly once. Submitting the
/// same workflow again requires a fresh descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Workflow identifier; also the name of the staged Nextflow script.
    pub workflow_id: String,

    /// Workspace identifier; the directory name inside the bundle.
    pub workspace_id: String,

    /// Remote run directory the bundle is staged into.
    pub remote_dir: String,

    /// Remote path of the staged bundle archive.
    pub bundle_path: String,

    /// Remote path the batch script is written to.
    pub script_path: String,

    /// METS file group holding the input images.
    pub input_file_group: String,

    /// METS file name inside the workspace.
    pub mets_filename: String,

    /// Number of pages in the workspace, if known.
    pub pages: Option<u32>,

    /// Requested Nextflow process forks.
    pub forks: Option<u32>,

    script: Option<String>,
    job_id: Option<SchedulerJobId>,
    submitted_at: Option<DateTime<Utc>>,
}

impl JobDescriptor {
    /// Create a descriptor for running `workflow_id` on `workspace_id` in `remote_dir`.
    pub fn new(
        workflow_id: impl Into<String>,
        workspace_id: impl Into<String>,
        remote_dir: impl Into<String>,
    ) -> Self {
        let workspace_id = workspace_id.into();
        let remote_dir = remote_dir.into();
        Self {
            bundle_path: format!("{remote_dir}/{workspace_id}.tar.gz"),
            script_path: format!("{remote_dir}/job.sh"),
            workflow_id: workflow_id.into(),
            workspace_id,
            remote_dir,
            input_file_group: DEFAULT_INPUT_FILE_GROUP.to_string(),
            mets_filename: DEFAULT_METS_FILENAME.to_string(),
            pages: None,
            forks: None,
            script: None,
            job_id: None,
            submitted_at: None,
        }
    }

    pub fn with_bundle_path(mut self, path: impl Into<String>) -> Self {
        self.bundle_path = path.into();
        self
    }

    pub fn with_script_path(mut self, path: impl Into<String>) -> Self {
        self.script_path = path.into();
        self
    }

    pub fn with_input(
        mut self,
        input_file_group: impl Into<String>,
        mets_filename: impl Into<String>,
    ) -> Self {
        self.input_file_group = input_file_group.into();
        self.mets_filename = mets_filename.into();
        self
    }

    pub fn with_pages(mut self, pages: u32) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_forks(mut self, forks: u32) -> Self {
        self.forks = Some(forks);
        self
    }

    /// Batch-job name shown by `squeue`.
    pub fn job_name(&self) -> String {
        format!("{}-{}", self.workflow_id, self.workspace_id)
    }

    /// Remote path of the staged workspace after the bundle is unpacked.
    pub fn workspace_dir(&self) -> String {
        format!("{}/{}", self.remote_dir, self.workspace_id)
    }

    /// Remote path of the staged Nextflow script.
    pub fn workflow_script(&self) -> String {
        format!("{}/{}.nf", self.remote_dir, self.workflow_id)
    }

    /// Remote path of the result archive written by the batch script.
    pub fn output_path(&self) -> String {
        format!("{}/{}", self.remote_dir, OUTPUT_ARCHIVE)
    }

    /// Rendered batch script, once submission has started.
    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    /// Scheduler job id, once submission has succeeded.
    pub fn job_id(&self) -> Option<&SchedulerJobId> {
        self.job_id.as_ref()
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn is_submitted(&self) -> bool {
        self.job_id.is_some()
    }

    /// Record the rendered script. Fails once the descriptor has been submitted.
    pub fn set_script(&mut self, script: String) -> SchedResult<()> {
        self.ensure_unsubmitted()?;
        self.script = Some(script);
        Ok(())
    }

    /// Record the scheduler job id. Fails if one is already present.
    pub fn assign_job_id(&mut self, job_id: SchedulerJobId) -> SchedResult<()> {
        self.ensure_unsubmitted()?;
        self.job_id = Some(job_id);
        self.submitted_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_unsubmitted(&self) -> SchedResult<()> {
        match &self.job_id {
            Some(id) => Err(SchedError::InvalidJobState {
                expected: "unsubmitted descriptor".to_string(),
                found: format!("submitted as job {id}"),
            }),
            None => Ok(()),
        }
    }
}
