//! hpcflow Command-Line Interface
//!
//! The main entry point for the hpcflow CLI tool.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use console::style;

mod commands;
mod tracing_config;

use commands::{cancel, check, common, recover, status, submit, version, workspace};
use hpcflow_sched::RunRequest;

/// hpcflow - run OCR workflows on SLURM clusters
#[derive(Parser)]
#[command(name = "hpcflow")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (YAML)
    #[arg(short, long, env = "HPCFLOW_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow on a workspace and wait until it finishes
    Submit {
        /// Workflow id (a `<id>.nf` template in the template directory)
        #[arg(long)]
        workflow: String,

        /// Registered workspace id
        #[arg(long)]
        workspace: String,

        /// Input file group inside the METS file
        #[arg(long, default_value = "DEFAULT")]
        input_group: String,

        /// METS file name inside the workspace
        #[arg(long, default_value = "mets.xml")]
        mets: String,

        /// Number of pages (caps the number of forks)
        #[arg(long)]
        pages: Option<u32>,

        /// Parallel Nextflow forks
        #[arg(long)]
        forks: Option<u32>,
    },

    /// Query run status
    Status {
        /// Run ID (UUID)
        run_id: Option<String>,

        /// List all runs
        #[arg(short, long)]
        all: bool,

        /// Only runs of this workspace
        #[arg(long)]
        workspace: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Cancel a run
    Cancel {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Take over runs whose driving process died and wait for them
    Recover,

    /// Manage workspaces known to hpcflow
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },

    /// Check the connection to the cluster
    Check,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Register a local workspace directory
    Register {
        /// Workspace id
        id: String,

        /// Workspace directory
        path: String,
    },

    /// Show a workspace and its last run
    Show {
        /// Workspace id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Version => {
            version::execute();
            Ok(())
        }
        command => run(command, cli.config.as_deref(), cli.verbose).await,
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(command: Commands, config_file: Option<&str>, verbose: u8) -> anyhow::Result<()> {
    let config = common::load_config(config_file)?;
    tracing_config::init(&config.logging, verbose)?;

    match command {
        Commands::Submit {
            workflow,
            workspace,
            input_group,
            mets,
            pages,
            forks,
        } => {
            let mut request = RunRequest::new(workflow, workspace, input_group, mets);
            request.pages = pages;
            request.forks = forks;
            submit::execute(&config, request).await
        }

        Commands::Status {
            run_id,
            all,
            workspace,
            json,
        } => status::execute(&config, run_id.as_deref(), all, workspace.as_deref(), json).await,

        Commands::Cancel { run_id } => cancel::execute(&config, &run_id).await,

        Commands::Recover => recover::execute(&config).await,

        Commands::Workspace { action } => match action {
            WorkspaceAction::Register { id, path } => {
                workspace::execute_register(&config, &id, &path).await
            }
            WorkspaceAction::Show { id } => workspace::execute_show(&config, &id).await,
        },

        Commands::Check => check::execute(&config).await,

        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}
