//! Configuration loaded from `chatterm.yml`.
//!
//! Every field has a default, so an empty or partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "chatterm.yml";

/// Longest exponent applied to the recovery backoff (2^5 = 32x base).
const MAX_RECOVERY_BACKOFF_EXPONENT: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChattermConfig {
    pub cli: CliConfig,
    pub recovery: RecoveryConfig,
    pub reconnect: ReconnectConfig,
    /// WebSocket relay that receives chat events. Disabled when absent.
    pub relay_url: Option<String>,
}

impl ChattermConfig {
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as null, not as an empty mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Loads `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }
}

/// The AI CLI to spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub command: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// Working directory for the child. Defaults to the current directory.
    pub workspace_root: Option<PathBuf>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: Vec::new(),
            cols: 120,
            rows: 40,
            workspace_root: None,
        }
    }
}

/// Process auto-recovery tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub health_check_interval_ms: u64,
    pub enable_auto_restart: bool,
    /// How long a restarted process must stay up before the failure streak is
    /// forgiven.
    pub stability_window_ms: u64,
    /// Wait after a restart callback fails, before counting the next failure.
    pub restart_failure_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2000,
            exponential_backoff: true,
            health_check_interval_ms: 30_000,
            enable_auto_restart: true,
            stability_window_ms: 10_000,
            restart_failure_delay_ms: 5000,
        }
    }
}

impl RecoveryConfig {
    /// Backoff before recovery attempt `attempt` (1-based).
    ///
    /// Exponential: `base * 2^min(attempt - 1, 5)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        if !self.exponential_backoff {
            return Duration::from_millis(base);
        }
        let exponent = attempt.saturating_sub(1).min(MAX_RECOVERY_BACKOFF_EXPONENT);
        Duration::from_millis(base.saturating_mul(1 << exponent))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn restart_failure_delay(&self) -> Duration {
        Duration::from_millis(self.restart_failure_delay_ms)
    }
}

/// Transport auto-reconnect tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub max_retry_delay_ms: u64,
    pub ping_interval_ms: u64,
    pub enable_heartbeat: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_delay_ms: 2000,
            exponential_backoff: true,
            max_retry_delay_ms: 30_000,
            ping_interval_ms: 25_000,
            enable_heartbeat: true,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before reconnect attempt `attempt` (1-based).
    ///
    /// Exponential: `min(base * 2^(attempt - 1), max_retry_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        if !self.exponential_backoff {
            return Duration::from_millis(base);
        }
        let factor = 1_u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(factor).min(self.max_retry_delay_ms))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}
