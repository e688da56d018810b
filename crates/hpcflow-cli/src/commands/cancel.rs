//! Cancel command implementation.

use anyhow::Result;
use console::style;

use hpcflow_sched::{Config, RunId};

use super::common::{create_orchestrator, open_store, state_dir, style_state};

/// Execute the cancel command.
///
/// The run is flagged in the store; the process driving it cancels the
/// remote job at its next step. A run whose driver has stopped is taken over
/// and cancelled by this process before it exits.
pub async fn execute(config: &Config, run_id: &str) -> Result<()> {
    let state_dir = state_dir(config)?;
    let store = open_store(&state_dir)?;
    let orchestrator = create_orchestrator(config, store, &state_dir);

    let parsed_id =
        RunId::parse(run_id).map_err(|e| anyhow::anyhow!("Invalid run ID '{run_id}': {e}"))?;

    orchestrator
        .cancel_run(&parsed_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to cancel run: {e}"))?;

    if orchestrator.is_driving(&parsed_id).await {
        let status = orchestrator
            .wait_run(&parsed_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to cancel orphaned run: {e}"))?;
        orchestrator.shutdown().await;
        println!(
            "{} Run {} had no live driver; now {}",
            style("✓").green().bold(),
            style(run_id).dim(),
            style_state(status.state)
        );
        return Ok(());
    }

    let status = orchestrator
        .get_run_status(&parsed_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get status: {e}"))?;

    if status.state.is_terminal() {
        println!(
            "{} Run {} already finished: {}",
            style("→").cyan().bold(),
            style(run_id).dim(),
            style_state(status.state)
        );
    } else {
        println!(
            "{} Cancellation requested for run {}",
            style("✓").green().bold(),
            style(run_id).dim()
        );
    }

    Ok(())
}
