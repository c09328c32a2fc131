use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::core::supervisor::SupervisorConfig;

pub const CONFIG_FILE: &str = "botdeck.toml";
pub const DB_FILE: &str = "botdeck.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BotdeckConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub runner: RunnerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    /// How long a freshly spawned bot may run without a ready marker
    /// before it is considered running.
    #[serde(default = "default_observation_window_ms")]
    pub observation_window_ms: u64,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    /// Restart bots that were online when the daemon last went down.
    #[serde(default = "default_true")]
    pub resume_on_boot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token required on every request. Without one only loopback
    /// binds are served.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSettings {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_observation_window_ms() -> u64 {
    1500
}
fn default_grace_period_ms() -> u64 {
    5000
}
fn default_stderr_tail_lines() -> usize {
    20
}
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    17900
}
fn default_level() -> String {
    "info".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_stop_timeout_ms() -> u64 {
    4000
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            observation_window_ms: default_observation_window_ms(),
            grace_period_ms: default_grace_period_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
            resume_on_boot: true,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl BotdeckConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self, ConfigError> {
        let path = data_dir.as_ref().join(CONFIG_FILE);
        if !path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        info!(
            "Loaded {}: window={}ms, grace={}ms, api={}:{}",
            CONFIG_FILE,
            config.supervisor.observation_window_ms,
            config.supervisor.grace_period_ms,
            config.api.host,
            config.api.port
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: BotdeckConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::from(CONFIG_FILE),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if !(100..=10_000).contains(&s.observation_window_ms) {
            return Err(ConfigError::Invalid {
                key: "supervisor.observation_window_ms",
                reason: format!("{} is outside 100..=10000", s.observation_window_ms),
            });
        }
        if !(100..=60_000).contains(&s.grace_period_ms) {
            return Err(ConfigError::Invalid {
                key: "supervisor.grace_period_ms",
                reason: format!("{} is outside 100..=60000", s.grace_period_ms),
            });
        }
        if !(1..=1000).contains(&s.stderr_tail_lines) {
            return Err(ConfigError::Invalid {
                key: "supervisor.stderr_tail_lines",
                reason: format!("{} is outside 1..=1000", s.stderr_tail_lines),
            });
        }
        if self.runner.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "runner.heartbeat_secs",
                reason: "must be at least 1".into(),
            });
        }
        if self.runner.stop_timeout_ms >= s.grace_period_ms {
            return Err(ConfigError::Invalid {
                key: "runner.stop_timeout_ms",
                reason: format!(
                    "{} must be below supervisor.grace_period_ms ({})",
                    self.runner.stop_timeout_ms, s.grace_period_ms
                ),
            });
        }
        if parse_level(&self.logging.level).is_none() {
            return Err(ConfigError::Invalid {
                key: "logging.level",
                reason: format!("unknown level '{}'", self.logging.level),
            });
        }
        Ok(())
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            observation_window: Duration::from_millis(self.supervisor.observation_window_ms),
            grace_period: Duration::from_millis(self.supervisor.grace_period_ms),
            stderr_tail_lines: self.supervisor.stderr_tail_lines,
            ..SupervisorConfig::default()
        }
    }

    pub fn log_level(&self) -> tracing::Level {
        parse_level(&self.logging.level).unwrap_or(tracing::Level::INFO)
    }
}

fn parse_level(value: &str) -> Option<tracing::Level> {
    value.trim().parse().ok()
}
