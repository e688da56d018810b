//! Workspace command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use hpcflow_sched::{Config, WorkspaceRegistry};

use super::common::{open_store, state_dir};

/// Register a local workspace directory under `id`.
pub async fn execute_register(config: &Config, id: &str, path: &str) -> Result<()> {
    let path = Path::new(path)
        .canonicalize()
        .with_context(|| format!("Workspace directory not found: {path}"))?;
    if !path.is_dir() {
        anyhow::bail!("Not a directory: {}", path.display());
    }

    let store = open_store(&state_dir(config)?)?;
    store
        .register_workspace(id, &path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to register workspace: {e}"))?;

    println!(
        "{} Workspace {} registered at {}",
        style("✓").green().bold(),
        style(id).cyan(),
        path.display()
    );
    Ok(())
}

/// Show where a workspace lives and how its last run ended.
pub async fn execute_show(config: &Config, id: &str) -> Result<()> {
    let store = open_store(&state_dir(config)?)?;

    let path = store
        .workspace_path(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up workspace: {e}"))?;

    println!("{} Workspace {}", style("→").cyan().bold(), style(id).cyan());
    println!("  Path:        {}", path.display());

    let outcome = store
        .workspace_outcome(id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up workspace: {e}"))?;

    match outcome {
        Some((Some(status), result)) => {
            println!("  Last run:    {}", style(status).yellow());
            if let Some(result) = result {
                println!("  Results:     {}", result.display());
            }
        }
        _ => println!("  Last run:    {}", style("none").dim()),
    }

    Ok(())
}
