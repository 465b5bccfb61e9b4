use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Engine configuration, loaded from `scriptdeck.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// SMTP settings for the email notification channel. Alerts that need
    /// email are recorded as failed deliveries when this is absent.
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Watchdog timeout for one script process (one chain step).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Flush accumulated stdout to the execution record every N lines.
    #[serde(default = "default_flush_lines")]
    pub progress_flush_lines: usize,

    /// How long a stopped or timed-out child gets between SIGTERM and SIGKILL.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SandboxConfig {
    /// Run scripts inside the container runtime instead of on the host.
    #[serde(default)]
    pub enabled: bool,

    /// Override the per-interpreter default image.
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on how long `stop()` waits for in-flight executions.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub sender: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_scripts_dir() -> PathBuf {
    PathBuf::from("./scripts")
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_flush_lines() -> usize {
    10
}
fn default_stop_grace_ms() -> u64 {
    500
}
fn default_poll_interval_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_smtp_port() -> u16 {
    587
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scripts_dir: default_scripts_dir(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            progress_flush_lines: default_flush_lines(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl EngineConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("No {} found, using default engine config.", path.display());
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config: EngineConfig = toml::from_str(&content)?;
        info!(
            "Loaded engine config: timeout={}s, sandbox={}, poll={}s",
            config.execution.timeout_secs,
            config.sandbox.enabled,
            config.scheduler.poll_interval_secs
        );
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.execution.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs)
    }
}
