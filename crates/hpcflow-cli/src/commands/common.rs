//! Shared helpers for CLI commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use console::{StyledObject, style};

use hpcflow_sched::config::PathsConfig;
use hpcflow_sched::{
    Config, Orchestrator, RunState, RunStatus, SlurmExecutor, SqliteStore, TransferManager,
};

/// Load and validate the configuration.
pub fn load_config(config_file: Option<&str>) -> Result<Config> {
    Config::load(config_file).map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))
}

/// Return the default hpcflow state directory (~/.hpcflow/).
pub fn default_state_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".hpcflow"))
}

/// State directory from the configuration, created if missing.
pub fn state_dir(config: &Config) -> Result<PathBuf> {
    let state_dir = match &config.paths.state_dir {
        Some(dir) => dir.clone(),
        None => default_state_dir()?,
    };
    if !state_dir.exists() {
        fs::create_dir_all(&state_dir).with_context(|| {
            format!("Failed to create state directory: {}", state_dir.display())
        })?;
    }
    Ok(state_dir)
}

/// Open the run database inside the state directory.
pub fn open_store(state_dir: &Path) -> Result<Arc<SqliteStore>> {
    let db_path = PathsConfig::database_path(state_dir);
    let store = SqliteStore::new(&db_path)
        .map_err(|e| anyhow::anyhow!("Failed to open run store at {}: {}", db_path.display(), e))?;
    Ok(Arc::new(store))
}

/// Build an orchestrator talking to the configured cluster.
///
/// No connection is made until a command needs one.
pub fn create_orchestrator(
    config: &Config,
    store: Arc<SqliteStore>,
    state_dir: &Path,
) -> Orchestrator {
    let executor = SlurmExecutor::new(config.slurm.clone(), config.retry_policy());
    Orchestrator::new(
        config.orchestrator_config(state_dir),
        config.session_pool(),
        TransferManager::new(config.transfer_config()),
        Arc::new(executor),
        store.clone(),
        store,
    )
}

pub fn style_state(state: RunState) -> StyledObject<&'static str> {
    let name = state.name();
    match state {
        RunState::Done => style(name).green(),
        RunState::Failed | RunState::Cancelled => style(name).red(),
        RunState::Created => style(name).yellow(),
        _ => style(name).cyan(),
    }
}

/// Print the details of one run.
pub fn print_status(status: &RunStatus) {
    println!(
        "{} Run {} status: {}",
        style("→").cyan().bold(),
        style(&status.run_id).dim(),
        style_state(status.state).bold()
    );
    println!("  Workflow:  {}", status.workflow_id);
    println!("  Workspace: {}", status.workspace_id);

    if let Some(job_id) = &status.scheduler_job_id {
        match &status.job_status {
            Some(job_status) => println!(
                "  SLURM job: {} ({})",
                style(job_id).yellow(),
                job_status
            ),
            None => println!("  SLURM job: {}", style(job_id).yellow()),
        }
    }

    if let Some(reason) = &status.reason {
        println!("  Reason:    {}", style(reason).red());
    }

    if let Some(output) = &status.output {
        println!("  Results:   {}", style(output.display()).green());
    }

    if status.cancel_requested && !status.state.is_terminal() {
        println!("  Cancellation requested");
    }
}
