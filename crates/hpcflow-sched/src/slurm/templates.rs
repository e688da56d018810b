//! SLURM batch script templates.

use hpcflow_remote::shell_quote;
use tracing::warn;

use crate::job::{JobDescriptor, OUTPUT_ARCHIVE};
use crate::slurm::adapter::SlurmConfig;

/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKSPACE: &str = "/ws_data";

/// Name of the batch log inside the run directory; `%J` is the job id.
pub const LOG_PATTERN: &str = "slurm-job-%J.txt";

/// Path of the batch log for a submitted job.
pub fn log_path(remote_dir: &str, job_id: &str) -> String {
    format!("{}/{}", remote_dir, LOG_PATTERN.replace("%J", job_id))
}

/// Number of Nextflow forks to request, never more than there are pages.
pub fn effective_forks(job: &JobDescriptor, config: &SlurmConfig) -> u32 {
    let requested = job.forks.unwrap_or(config.default_forks).max(1);
    match job.pages {
        Some(pages) if pages > 0 && requested > pages => {
            warn!(
                "Requested {} forks for {} pages in {}; using {}",
                requested, pages, job.workspace_id, pages
            );
            pages
        }
        _ => requested,
    }
}

/// Generate the batch script that unpacks the bundle, runs the workflow and
/// packs the results.
pub fn generate_batch_script(job: &JobDescriptor, config: &SlurmConfig) -> String {
    let mut script = String::new();
    let run_dir = &job.remote_dir;

    // Shebang
    script.push_str("#!/bin/bash\n");

    // SLURM directives
    script.push_str(&format!(
        "#SBATCH --job-name={}\n",
        sanitize_name(&job.job_name())
    ));
    script.push_str(&format!("#SBATCH --partition={}\n", config.partition));
    if let Some(ref qos) = config.qos {
        script.push_str(&format!("#SBATCH --qos={}\n", qos));
    }
    if let Some(ref account) = config.account {
        script.push_str(&format!("#SBATCH --account={}\n", account));
    }
    script.push_str(&format!("#SBATCH --time={}\n", config.time_limit));
    script.push_str(&format!("#SBATCH --output={}/{}\n", run_dir, LOG_PATTERN));
    script.push_str(&format!("#SBATCH --chdir={}\n", run_dir));
    script.push_str(&format!("#SBATCH --cpus-per-task={}\n", config.cpus));
    script.push_str(&format!("#SBATCH --mem={}G\n", config.ram_gb));

    // Environment setup
    script.push_str("\n# Environment setup\n");
    script.push_str("set -e\n");
    script.push_str("set -o pipefail\n\n");

    if !config.modules.is_empty() {
        script.push_str("# Load required modules\n");
        for module in &config.modules {
            script.push_str(&format!("module load {}\n", module));
        }
        script.push('\n');
    }

    // Job information
    script.push_str("# Job information\n");
    script.push_str("echo \"Job ID: $SLURM_JOB_ID\"\n");
    script.push_str("echo \"Job Name: $SLURM_JOB_NAME\"\n");
    script.push_str("echo \"Node: $SLURM_NODELIST\"\n");
    script.push_str("echo \"Start Time: $(date)\"\n\n");

    script.push_str("# Unpack workspace and workflow\n");
    script.push_str(&format!(
        "tar -xzf {} -C {}\n\n",
        shell_quote(&job.bundle_path),
        shell_quote(run_dir)
    ));

    script.push_str("# Run workflow\n");
    script.push_str(&nextflow_command(job, config));
    script.push_str("\n\n");

    script.push_str("# Pack results\n");
    let output = job.output_path();
    let partial = format!("{output}.partial");
    script.push_str(&format!(
        "tar -czf {} -C {} {}\n",
        shell_quote(&partial),
        shell_quote(run_dir),
        shell_quote(&job.workspace_id)
    ));
    script.push_str(&format!(
        "mv {} {}\n",
        shell_quote(&partial),
        shell_quote(&output)
    ));

    // Completion message
    script.push_str("\necho \"Job completed at: $(date)\"\n");

    script
}

/// The Nextflow invocation for a job.
///
/// With a container image configured, the workspace is bound at
/// [`CONTAINER_WORKSPACE`] and processors run through `apptainer exec`.
pub fn nextflow_command(job: &JobDescriptor, config: &SlurmConfig) -> String {
    let workspace_dir = job.workspace_dir();
    let (workspace_arg, mets_arg) = match config.container_image {
        Some(_) => (
            CONTAINER_WORKSPACE.to_string(),
            format!("{}/{}", CONTAINER_WORKSPACE, job.mets_filename),
        ),
        None => (
            workspace_dir.clone(),
            format!("{}/{}", workspace_dir, job.mets_filename),
        ),
    };

    let mut args = vec![
        config.nextflow_bin.clone(),
        "run".to_string(),
        shell_quote(&job.workflow_script()),
        "-ansi-log".to_string(),
        "false".to_string(),
        "-with-report".to_string(),
        "--input_file_group".to_string(),
        shell_quote(&job.input_file_group),
        "--mets".to_string(),
        shell_quote(&mets_arg),
        "--workspace_dir".to_string(),
        shell_quote(&workspace_arg),
    ];
    if let Some(pages) = job.pages {
        args.push("--pages".to_string());
        args.push(pages.to_string());
    }
    args.extend([
        "--cpus".to_string(),
        config.cpus.to_string(),
        "--ram".to_string(),
        format!("{}G", config.ram_gb),
        "--forks".to_string(),
        effective_forks(job, config).to_string(),
    ]);
    if let Some(ref image) = config.container_image {
        let wrapper = format!(
            "apptainer exec --bind {}:{} {}",
            workspace_dir, CONTAINER_WORKSPACE, image
        );
        args.push("--singularity_wrapper".to_string());
        args.push(shell_quote(&wrapper));
    }

    args.join(" ")
}

/// Sanitize a name for use in SLURM job names.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect()
}
