//! Recover command implementation.
//!
//! Takes over runs whose driving process died and follows them to the end
//! in the foreground, like `submit`.

use anyhow::Result;
use console::style;
use tracing::info;

use hpcflow_sched::Config;

use super::common::{create_orchestrator, open_store, state_dir, style_state};

/// Execute the recover command.
pub async fn execute(config: &Config) -> Result<()> {
    let state_dir = state_dir(config)?;
    let store = open_store(&state_dir)?;
    let orchestrator = create_orchestrator(config, store, &state_dir);

    let adopted = orchestrator
        .recover()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to recover runs: {e}"))?;

    if adopted.is_empty() {
        println!("{} No orphaned runs", style("→").cyan().bold());
        return Ok(());
    }

    println!(
        "{} Took over {} run(s); waiting for them to finish",
        style("→").cyan().bold(),
        adopted.len()
    );

    let mut failed = 0;
    for run_id in &adopted {
        let status = orchestrator
            .wait_run(run_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to wait for run {run_id}: {e}"))?;
        info!("Recovered run {} ended in {}", run_id, status.state);
        println!("  {}  {}", style(run_id).dim(), style_state(status.state));
        if status.state != hpcflow_sched::RunState::Done {
            failed += 1;
        }
    }
    orchestrator.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{failed} recovered run(s) did not finish successfully");
    }
    Ok(())
}
