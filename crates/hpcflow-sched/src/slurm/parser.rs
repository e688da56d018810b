//! Parsers for SLURM command output.
//!
//! This is the only place that knows SLURM's text formats and state
//! vocabulary. Everything downstream sees [`JobStatus`].

use crate::error::{SchedError, SchedResult};
use crate::job::{JobStatus, SchedulerJobId};
use crate::slurm::adapter::{SlurmJobInfo, SlurmState};

/// Parse sbatch output to extract the job ID.
///
/// Accepts `Submitted batch job <ID>` anywhere in the output (sites often
/// print warnings first) and the `--parsable` form `<ID>[;cluster]`, which
/// must be the only line.
pub fn parse_sbatch_output(output: &str) -> SchedResult<SchedulerJobId> {
    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Submitted batch job ") {
            let job_id = rest.split_whitespace().next().unwrap_or_default();
            if is_job_id(job_id) {
                return Ok(SchedulerJobId::new(job_id));
            }
        }
    }

    let trimmed = output.trim();
    if !trimmed.contains('\n') {
        let job_id = trimmed.split(';').next().unwrap_or_default();
        if is_job_id(job_id) {
            return Ok(SchedulerJobId::new(job_id));
        }
    }

    Err(SchedError::SlurmCommandError {
        command: "sbatch".to_string(),
        message: format!("Unexpected output format: {}", trimmed),
    })
}

fn is_job_id(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Parse squeue output to extract job information.
///
/// Expected format (from `squeue -j <id> -o "%i|%j|%T|%r"`):
/// JOBID|NAME|STATE|REASON
/// 12345|job_name|RUNNING|None
pub fn parse_squeue_output(output: &str) -> SchedResult<Option<SlurmJobInfo>> {
    let lines: Vec<&str> = output.lines().collect();

    // Skip header line
    if lines.len() < 2 {
        return Ok(None);
    }

    let data_line = lines[1].trim();
    if data_line.is_empty() {
        return Ok(None);
    }

    let parts: Vec<&str> = data_line.split('|').collect();
    if parts.len() < 4 {
        return Err(SchedError::SlurmCommandError {
            command: "squeue".to_string(),
            message: format!("Unexpected output format: {}", data_line),
        });
    }

    let reason = match parts[3].trim() {
        "None" | "" => None,
        other => Some(other.to_string()),
    };

    Ok(Some(SlurmJobInfo {
        job_id: parts[0].trim().to_string(),
        name: parts[1].trim().to_string(),
        state: parse_slurm_state(parts[2]),
        reason,
        exit_code: None,
    }))
}

/// Parse sacct output for finished job information.
///
/// Expected format (from `sacct -j <id> -o JobID,JobName,State,ExitCode -P`):
/// JobID|JobName|State|ExitCode
/// 12345|job_name|COMPLETED|0:0
/// 12345.batch|batch|COMPLETED|0:0
pub fn parse_sacct_output(output: &str) -> SchedResult<Option<SlurmJobInfo>> {
    let lines: Vec<&str> = output.lines().collect();

    // Skip header line
    if lines.len() < 2 {
        return Ok(None);
    }

    // Find the allocation line (not .batch or .extern)
    for line in &lines[1..] {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            continue;
        }

        let job_id = parts[0].trim();
        if job_id.contains('.') {
            continue;
        }

        return Ok(Some(SlurmJobInfo {
            job_id: job_id.to_string(),
            name: parts[1].trim().to_string(),
            state: parse_slurm_state(parts[2]),
            reason: None,
            exit_code: parse_exit_code(parts[3].trim()),
        }));
    }

    Ok(None)
}

/// Parse a SLURM state string.
///
/// Tolerates the decorations sacct and squeue add: `CANCELLED by 1234`,
/// `RUNNING+`, lowercase, and the compact two-letter codes.
pub fn parse_slurm_state(raw: &str) -> SlurmState {
    let word = raw.split_whitespace().next().unwrap_or_default();
    let word = word.trim_end_matches('+').to_uppercase();
    match word.as_str() {
        "PENDING" | "PD" => SlurmState::Pending,
        "CONFIGURING" | "CF" => SlurmState::Configuring,
        "RUNNING" | "R" => SlurmState::Running,
        "COMPLETING" | "CG" => SlurmState::Completing,
        "COMPLETED" | "CD" => SlurmState::Completed,
        "FAILED" | "F" => SlurmState::Failed,
        "TIMEOUT" | "TO" => SlurmState::Timeout,
        "CANCELLED" | "CA" => SlurmState::Cancelled,
        "NODE_FAIL" | "NF" => SlurmState::NodeFail,
        "PREEMPTED" | "PR" => SlurmState::Preempted,
        "OUT_OF_MEMORY" | "OOM" => SlurmState::OutOfMemory,
        "BOOT_FAIL" | "BF" => SlurmState::BootFail,
        "DEADLINE" | "DL" => SlurmState::Deadline,
        "REQUEUED" | "RQ" => SlurmState::Requeued,
        "REQUEUE_FED" | "RF" => SlurmState::RequeueFed,
        "REQUEUE_HOLD" | "RH" => SlurmState::RequeueHold,
        "RESIZING" | "RS" => SlurmState::Resizing,
        "REVOKED" | "RV" => SlurmState::Revoked,
        "SIGNALING" | "SI" => SlurmState::Signaling,
        "SPECIAL_EXIT" | "SE" => SlurmState::SpecialExit,
        "STAGE_OUT" | "SO" => SlurmState::StageOut,
        "STOPPED" | "ST" => SlurmState::Stopped,
        "SUSPENDED" | "S" => SlurmState::Suspended,
        _ => SlurmState::Unknown(raw.trim().to_string()),
    }
}

/// Translate a SLURM state into the canonical job status.
pub fn map_state(state: &SlurmState) -> JobStatus {
    match state {
        SlurmState::Pending
        | SlurmState::Requeued
        | SlurmState::RequeueFed
        | SlurmState::RequeueHold
        | SlurmState::Resizing => JobStatus::Queued,
        SlurmState::Configuring | SlurmState::Stopped => JobStatus::Pending,
        SlurmState::Running
        | SlurmState::Completing
        | SlurmState::StageOut
        | SlurmState::Signaling => JobStatus::Running,
        SlurmState::Completed => JobStatus::Succeeded,
        SlurmState::Failed
        | SlurmState::BootFail
        | SlurmState::Deadline
        | SlurmState::NodeFail
        | SlurmState::OutOfMemory
        | SlurmState::Preempted
        | SlurmState::Revoked
        | SlurmState::SpecialExit
        | SlurmState::Suspended
        | SlurmState::Timeout => JobStatus::Failed,
        SlurmState::Cancelled => JobStatus::Cancelled,
        SlurmState::Unknown(_) => JobStatus::Unknown,
    }
}

/// Parse exit code from SLURM format "exit_code:signal".
fn parse_exit_code(code: &str) -> Option<i32> {
    code.split(':').next().and_then(|s| s.parse().ok())
}

/// Whether squeue's stderr says the job has left the queue.
pub fn is_unknown_job_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("invalid job id") || stderr.contains("does not exist")
}

/// Parse scancel output to verify cancellation.
///
/// A job that already finished or is already completing counts as cancelled.
pub fn parse_scancel_output(exit_code: i32, stderr: &str) -> SchedResult<()> {
    let stderr = stderr.trim();
    if stderr.is_empty() && exit_code == 0 {
        return Ok(());
    }

    let lowered = stderr.to_lowercase();
    if is_unknown_job_error(stderr)
        || lowered.contains("already completing")
        || lowered.contains("already completed")
        || lowered.contains("job has finished")
    {
        return Ok(());
    }

    Err(SchedError::SlurmCommandError {
        command: "scancel".to_string(),
        message: if stderr.is_empty() {
            format!("exited with {exit_code}")
        } else {
            stderr.to_string()
        },
    })
}
