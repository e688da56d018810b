//! Configuration management for hpcflow.
//!
//! Supports loading configuration from:
//! 1. Configuration files (YAML)
//! 2. Environment variables (with HPCFLOW_ prefix)
//! 3. .env files
//!
//! Configuration precedence (highest to lowest):
//! 1. Environment variables
//! 2. Configuration file
//! 3. Default values

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hpcflow_remote::{SessionConfig, SessionPool, SshConfig, SshConnector};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::SchedError;
use crate::orchestrator::{OrchestratorConfig, PollConfig};
use crate::retry::RetryPolicy;
use crate::slurm::SlurmConfig;
use crate::transfer::TransferConfig;

/// Complete hpcflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Login node and session settings
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Local and remote directory layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// SLURM resources and command limits
    #[serde(default)]
    pub slurm: SlurmConfig,

    /// Bundle transfer retries and timeouts
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Status polling cadence
    #[serde(default)]
    pub polling: PollConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Login node settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// SSH endpoint and credentials
    #[serde(flatten)]
    pub ssh: SshConfig,

    /// Connection attempts when opening a session
    #[serde(default = "default_reconnect_tries")]
    pub reconnect_tries: u32,

    /// Pause between connection attempts in seconds
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Independent sessions shared by concurrent runs
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.ssh.host)
            .field("port", &self.ssh.port)
            .field("username", &self.ssh.username)
            .field("key_path", &self.ssh.key_path)
            .field(
                "passphrase",
                &self.ssh.passphrase.as_ref().map(|_| "[REDACTED]"),
            )
            .field("reconnect_tries", &self.reconnect_tries)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::new("", "", "~/.ssh/id_rsa"),
            reconnect_tries: default_reconnect_tries(),
            reconnect_delay_secs: default_reconnect_delay(),
            pool_size: default_pool_size(),
        }
    }
}

/// Directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Absolute root of the run layout on the cluster
    #[serde(default)]
    pub remote_root: String,

    /// Local directory holding `<workflow_id>.nf` templates
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,

    /// Local state directory (run database, staging, results)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Bundle staging directory; defaults to `<state_dir>/staging`
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Result directory; defaults to `<state_dir>/output`
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            remote_root: String::new(),
            template_dir: default_template_dir(),
            state_dir: None,
            staging_dir: None,
            output_dir: None,
        }
    }
}

impl PathsConfig {
    /// Configured state directory, or `fallback`.
    pub fn state_dir_or(&self, fallback: PathBuf) -> PathBuf {
        self.state_dir.clone().unwrap_or(fallback)
    }

    pub fn staging_dir(&self, state_dir: &Path) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("staging"))
    }

    pub fn output_dir(&self, state_dir: &Path) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| state_dir.join("output"))
    }

    /// Run database inside the state directory.
    pub fn database_path(state_dir: &Path) -> PathBuf {
        state_dir.join("runs.db")
    }
}

/// Transfer retry and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Attempts per transfer, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry in seconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,

    /// Backoff cap in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,

    /// Timeout of a single upload or download in seconds
    #[serde(default = "default_transfer_timeout")]
    pub timeout_secs: u64,

    /// Timeout of digest, rename and cleanup commands in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            timeout_secs: default_transfer_timeout(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (console, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions

fn default_reconnect_tries() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    2
}

fn default_pool_size() -> usize {
    2
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("workflows")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    2
}

fn default_max_backoff() -> u64 {
    60
}

fn default_transfer_timeout() -> u64 {
    1800
}

fn default_command_timeout() -> u64 {
    120
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "console".to_string()
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;

        serde_yaml_ng::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load configuration with the following precedence:
    /// 1. Load .env file if it exists
    /// 2. Load from file if provided
    /// 3. Apply environment variable overrides
    ///
    /// Validation runs once, after all sources are merged.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let config = match config_file {
            Some(path) => Self::parse_file(path)?,
            None => Config::default(),
        };

        let config = config.merge_env();
        config.validate()?;
        Ok(config)
    }

    /// Merge `HPCFLOW_*` environment variables into this configuration.
    fn merge_env(self) -> Self {
        self.merge_env_from(|key| std::env::var(key).ok())
    }

    /// Merge overrides from `lookup`. Absent keys leave fields unchanged;
    /// unparsable numbers are ignored.
    pub fn merge_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Remote
        if let Some(v) = lookup("HPCFLOW_HOST") {
            self.remote.ssh.host = v;
        }
        if let Some(v) = lookup("HPCFLOW_PORT") {
            if let Ok(val) = v.parse() {
                self.remote.ssh.port = val;
            }
        }
        if let Some(v) = lookup("HPCFLOW_USER") {
            self.remote.ssh.username = v;
        }
        if let Some(v) = lookup("HPCFLOW_KEY_PATH") {
            self.remote.ssh.key_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("HPCFLOW_KEY_PASSPHRASE") {
            self.remote.ssh.passphrase = Some(SecretString::new(v.into()));
        }
        if let Some(v) = lookup("HPCFLOW_POOL_SIZE") {
            if let Ok(val) = v.parse() {
                self.remote.pool_size = val;
            }
        }

        // Paths
        if let Some(v) = lookup("HPCFLOW_REMOTE_ROOT") {
            self.paths.remote_root = v;
        }
        if let Some(v) = lookup("HPCFLOW_TEMPLATE_DIR") {
            self.paths.template_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HPCFLOW_STATE_DIR") {
            self.paths.state_dir = Some(PathBuf::from(v));
        }

        // SLURM
        if let Some(v) = lookup("HPCFLOW_PARTITION") {
            self.slurm.partition = v;
        }
        if let Some(v) = lookup("HPCFLOW_QOS") {
            self.slurm.qos = Some(v).filter(|q| !q.is_empty());
        }
        if let Some(v) = lookup("HPCFLOW_ACCOUNT") {
            self.slurm.account = Some(v).filter(|a| !a.is_empty());
        }

        // Logging
        if let Some(v) = lookup("HPCFLOW_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("HPCFLOW_LOG_FORMAT") {
            self.logging.format = v;
        }

        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Remote endpoint
        if self.remote.ssh.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "remote.host is required (or set HPCFLOW_HOST)".to_string(),
            ));
        }
        if self.remote.ssh.username.is_empty() {
            return Err(ConfigError::ValidationError(
                "remote.username is required (or set HPCFLOW_USER)".to_string(),
            ));
        }
        if self.remote.ssh.port == 0 {
            return Err(ConfigError::ValidationError(
                "remote.port must be greater than 0".to_string(),
            ));
        }
        if self.remote.pool_size == 0 || self.remote.reconnect_tries == 0 {
            return Err(ConfigError::ValidationError(
                "remote.pool_size and remote.reconnect_tries must be greater than 0".to_string(),
            ));
        }

        // Remote layout
        if !self.paths.remote_root.starts_with('/') {
            return Err(ConfigError::ValidationError(format!(
                "paths.remote_root must be an absolute path, got '{}'",
                self.paths.remote_root
            )));
        }

        // SLURM
        if self.slurm.partition.is_empty() {
            return Err(ConfigError::ValidationError(
                "slurm.partition must not be empty".to_string(),
            ));
        }
        if self.slurm.cpus == 0 || self.slurm.ram_gb == 0 {
            return Err(ConfigError::ValidationError(
                "slurm.cpus and slurm.ram_gb must be greater than 0".to_string(),
            ));
        }
        if !is_valid_time_limit(&self.slurm.time_limit) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid slurm.time_limit: {}",
                self.slurm.time_limit
            )));
        }

        // Transfers
        if self.transfer.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "transfer.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.transfer.initial_backoff_secs > self.transfer.max_backoff_secs {
            return Err(ConfigError::ValidationError(
                "transfer.initial_backoff_secs exceeds transfer.max_backoff_secs".to_string(),
            ));
        }

        // Polling
        if self.polling.interval_min_secs == 0
            || self.polling.interval_min_secs > self.polling.interval_max_secs
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid polling interval range: {}..{}",
                self.polling.interval_min_secs, self.polling.interval_max_secs
            )));
        }
        if self.polling.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "polling.backoff_factor must be at least 1.0, got {}",
                self.polling.backoff_factor
            )));
        }
        if self.polling.max_run_secs == 0 {
            return Err(ConfigError::ValidationError(
                "polling.max_run_secs must be greater than 0".to_string(),
            ));
        }
        if self.polling.owner_lease_secs < 30 {
            return Err(ConfigError::ValidationError(format!(
                "polling.owner_lease_secs must be at least 30, got {}",
                self.polling.owner_lease_secs
            )));
        }

        // Validate log level
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {other}"
                )));
            }
        }

        // Validate log format
        match self.logging.format.as_str() {
            "console" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {other}"
                )));
            }
        }

        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            open_attempts: self.remote.reconnect_tries,
            open_retry_delay: Duration::from_secs(self.remote.reconnect_delay_secs),
        }
    }

    /// Session pool to the configured login node.
    pub fn session_pool(&self) -> SessionPool {
        let connector = Arc::new(SshConnector::new(self.remote.ssh.clone()));
        SessionPool::with_connector(connector, self.session_config(), self.remote.pool_size)
    }

    /// Retry policy shared by transfers and status queries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.transfer.max_attempts)
            .with_backoff(
                Duration::from_secs(self.transfer.initial_backoff_secs),
                Duration::from_secs(self.transfer.max_backoff_secs),
            )
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            retry: self.retry_policy(),
            transfer_timeout: Duration::from_secs(self.transfer.timeout_secs),
            command_timeout: Duration::from_secs(self.transfer.command_timeout_secs),
        }
    }

    pub fn orchestrator_config(&self, state_dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig::new(
            self.paths.remote_root.clone(),
            self.paths.template_dir.clone(),
            self.paths.staging_dir(state_dir),
            self.paths.output_dir(state_dir),
        )
        .with_polling(self.polling.clone())
    }
}

/// `minutes`, `minutes:seconds`, `hours:minutes:seconds`, `days-hours`,
/// `days-hours:minutes` or `days-hours:minutes:seconds`.
fn is_valid_time_limit(limit: &str) -> bool {
    let (days, clock) = match limit.split_once('-') {
        Some((days, clock)) => (Some(days), clock),
        None => (None, limit),
    };
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if let Some(days) = days {
        if !numeric(days) {
            return false;
        }
    }
    let parts: Vec<&str> = clock.split(':').collect();
    parts.len() <= 3 && parts.iter().all(|p| numeric(p))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for SchedError {
    fn from(err: ConfigError) -> Self {
        SchedError::ConfigError(err.to_string())
    }
}
