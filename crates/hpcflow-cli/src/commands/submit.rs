//! Submit command implementation.
//!
//! Runs a workflow in the foreground: this process owns the run until it
//! reaches a terminal state. Ctrl-C requests cancellation.

use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use hpcflow_sched::{RunRequest, RunState};

use super::common::{create_orchestrator, open_store, print_status, state_dir};

/// Execute the submit command.
pub async fn execute(config: &hpcflow_sched::Config, request: RunRequest) -> Result<()> {
    let state_dir = state_dir(config)?;
    let store = open_store(&state_dir)?;
    let orchestrator = create_orchestrator(config, store, &state_dir);

    println!(
        "{} Submitting workflow {} on workspace {} to {}",
        style("→").cyan().bold(),
        style(&request.workflow_id).cyan(),
        style(&request.workspace_id).cyan(),
        style(&config.remote.ssh.host).yellow()
    );

    let run_id = orchestrator
        .submit_request(request)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to submit run: {e}"))?;

    info!("Run {} submitted", run_id);
    println!("  Run ID: {}", style(&run_id).dim());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("Starting run...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let waiter = orchestrator.wait_run(&run_id);
    tokio::pin!(waiter);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            result = &mut waiter => break result,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                spinner.set_message("Cancelling...");
                if let Err(e) = orchestrator.cancel_run(&run_id).await {
                    spinner.println(format!("{} Cancel failed: {e}", style("!").yellow().bold()));
                }
            }
            _ = ticker.tick() => {
                if let Ok(status) = orchestrator.get_run_status(&run_id).await {
                    let message = match &status.job_status {
                        Some(job_status) if status.state == RunState::Polling => {
                            format!("Status: {} (SLURM: {})", status.state, job_status)
                        }
                        _ => format!("Status: {} ...", status.state),
                    };
                    spinner.set_message(message);
                }
            }
        }
    };

    spinner.finish_and_clear();
    orchestrator.shutdown().await;

    let status = outcome.map_err(|e| anyhow::anyhow!("Failed to wait for run: {e}"))?;
    print_status(&status);

    match status.state {
        RunState::Done => {
            println!("\n{} Run finished", style("✓").green().bold());
            Ok(())
        }
        state => anyhow::bail!("Run {} ended in state {}", run_id, state),
    }
}
