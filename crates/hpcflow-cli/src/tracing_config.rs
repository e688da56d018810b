//! Log output setup.
//!
//! Logs go to stderr so that command output on stdout stays parseable.

use anyhow::Result;
use hpcflow_sched::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable console output.
    Console,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    pub fn parse(format: &str) -> Self {
        match format {
            "json" => LogFormat::Json,
            _ => LogFormat::Console,
        }
    }
}

/// Level filter: `-v` flags win over the configured level.
pub fn level_for(verbose: u8, configured: &str) -> &str {
    match verbose {
        0 => configured,
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides everything.
pub fn init(logging: &LoggingConfig, verbose: u8) -> Result<()> {
    let level = level_for(verbose, &logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = match LogFormat::parse(&logging.format) {
        LogFormat::Console => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}
