//! Check command implementation.
//!
//! Verifies that the cluster is reachable and the local templates exist.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;

use hpcflow_sched::Config;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute the check command.
pub async fn execute(config: &Config) -> Result<()> {
    let ssh = &config.remote.ssh;
    println!(
        "{} Connecting to {}@{}:{}",
        style("→").cyan().bold(),
        ssh.username,
        ssh.host,
        ssh.port
    );

    let pool = config.session_pool();
    let result = check_cluster(config, &pool).await;
    pool.close_all().await;
    result?;

    list_templates(config)?;

    println!("\n{} Cluster is ready", style("✓").green().bold());
    Ok(())
}

async fn check_cluster(config: &Config, pool: &hpcflow_remote::SessionPool) -> Result<()> {
    let session = pool
        .acquire()
        .await
        .map_err(|e| anyhow::anyhow!("Connection failed: {e}"))?;

    let hostname = session
        .execute("hostname", CHECK_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Remote command failed: {e}"))?;
    println!("  Login node:  {}", style(hostname.stdout.trim()).green());

    let squeue = session
        .execute("squeue --version", CHECK_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Remote command failed: {e}"))?;
    if squeue.exit_code == 0 {
        println!("  SLURM:       {}", style(squeue.stdout.trim()).green());
    } else {
        anyhow::bail!(
            "SLURM is not available on {}: {}",
            config.remote.ssh.host,
            squeue.stderr.trim()
        );
    }

    let mut channel = session
        .with_channel()
        .await
        .map_err(|e| anyhow::anyhow!("Connection failed: {e}"))?;
    channel
        .mkdir_all(&config.paths.remote_root, CHECK_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot create {}: {e}", config.paths.remote_root))?;
    println!("  Remote root: {}", style(&config.paths.remote_root).green());

    Ok(())
}

fn list_templates(config: &Config) -> Result<()> {
    let dir = &config.paths.template_dir;
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read template directory: {}", dir.display()))?;

    let mut workflows: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "nf"))
        .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    workflows.sort();

    if workflows.is_empty() {
        anyhow::bail!("No workflow templates (*.nf) in {}", dir.display());
    }
    println!("  Workflows:   {}", workflows.join(", "));
    Ok(())
}
