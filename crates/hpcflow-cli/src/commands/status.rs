//! Status command implementation.
//!
//! Query run status from the local run store.

use anyhow::Result;
use console::style;

use hpcflow_sched::{Config, RunFilter, RunId};

use super::common::{create_orchestrator, open_store, print_status, state_dir, style_state};

/// Execute the status command.
pub async fn execute(
    config: &Config,
    run_id: Option<&str>,
    all: bool,
    workspace: Option<&str>,
    json: bool,
) -> Result<()> {
    let state_dir = state_dir(config)?;
    let store = open_store(&state_dir)?;
    let orchestrator = create_orchestrator(config, store, &state_dir);

    if all || workspace.is_some() {
        let mut filter = RunFilter::default();
        if let Some(workspace) = workspace {
            filter = filter.with_workspace(workspace);
        }
        let runs = orchestrator
            .list_runs(&filter)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

        if json {
            println!("{}", serde_json::to_string_pretty(&runs)?);
            return Ok(());
        }

        if runs.is_empty() {
            println!("No runs found.");
            return Ok(());
        }

        println!("{} {} run(s):\n", style("→").cyan().bold(), runs.len());

        println!(
            "  {:<36}  {:<20}  {:<16}  {:<12}  {:<10}  {}",
            style("RUN ID").bold(),
            style("WORKFLOW").bold(),
            style("WORKSPACE").bold(),
            style("STATE").bold(),
            style("SLURM").bold(),
            style("CREATED").bold()
        );
        println!("  {}", "-".repeat(116));

        for run in &runs {
            let created = run
                .history
                .first()
                .map(|t| t.at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            let job_id = run
                .scheduler_job_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string());

            println!(
                "  {:<36}  {:<20}  {:<16}  {:<12}  {:<10}  {}",
                style(&run.run_id).dim(),
                run.workflow_id,
                run.workspace_id,
                style_state(run.state),
                job_id,
                created,
            );
        }

        return Ok(());
    }

    let run_id_str = run_id
        .ok_or_else(|| anyhow::anyhow!("Please provide a run ID or use --all to list all runs"))?;

    let parsed_id = RunId::parse(run_id_str)
        .map_err(|e| anyhow::anyhow!("Invalid run ID '{run_id_str}': {e}"))?;

    let status = orchestrator
        .get_run_status(&parsed_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get status: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&status);

    if !status.history.is_empty() {
        println!("  History:");
        for transition in &status.history {
            println!(
                "    {}  {:<12}  {}",
                style(transition.at.format("%Y-%m-%d %H:%M:%S")).dim(),
                transition.to.name(),
                transition.reason
            );
        }
    }

    Ok(())
}
