//! Configuration management for infrahub-ops.
//!
//! Defaults are overridden by an optional TOML file, then by environment
//! variables and command-line flags (handled by the CLI layer).

use crate::utils::logger::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory where backup archives are written
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Explicit Docker Compose project name
    #[serde(default)]
    pub project: Option<String>,

    /// Explicit Kubernetes namespace
    #[serde(default)]
    pub k8s_namespace: Option<String>,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub neo4j: Neo4jConfig,

    #[serde(default)]
    pub postgres: PostgresConfig,

    #[serde(default)]
    pub timings: Timings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default)]
    pub format: LogFormat,
}

/// Graph database credential overrides. Unset fields are resolved at run time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Task-manager database credential overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Poll intervals and timeouts, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timings {
    /// Cancellable pause before a community edition backup
    #[serde(default = "default_abort_window_ms")]
    pub abort_window_ms: u64,

    #[serde(default = "default_task_poll_ms")]
    pub task_poll_ms: u64,

    #[serde(default = "default_watchdog_ready_timeout_ms")]
    pub watchdog_ready_timeout_ms: u64,

    #[serde(default = "default_watchdog_ready_poll_ms")]
    pub watchdog_ready_poll_ms: u64,

    #[serde(default = "default_freeze_timeout_ms")]
    pub freeze_timeout_ms: u64,

    #[serde(default = "default_freeze_poll_ms")]
    pub freeze_poll_ms: u64,

    /// Attempts while waiting for a seeded cluster database to come online
    #[serde(default = "default_seed_online_attempts")]
    pub seed_online_attempts: u32,

    #[serde(default = "default_seed_online_interval_ms")]
    pub seed_online_interval_ms: u64,
}

// Default values
fn default_backup_dir() -> PathBuf {
    PathBuf::from("./infrahub_backups")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_abort_window_ms() -> u64 {
    10_000
}

fn default_task_poll_ms() -> u64 {
    5_000
}

fn default_watchdog_ready_timeout_ms() -> u64 {
    5_000
}

fn default_watchdog_ready_poll_ms() -> u64 {
    200
}

fn default_freeze_timeout_ms() -> u64 {
    120_000
}

fn default_freeze_poll_ms() -> u64 {
    1_000
}

fn default_seed_online_attempts() -> u32 {
    100
}

fn default_seed_online_interval_ms() -> u64 {
    2_000
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            abort_window_ms: default_abort_window_ms(),
            task_poll_ms: default_task_poll_ms(),
            watchdog_ready_timeout_ms: default_watchdog_ready_timeout_ms(),
            watchdog_ready_poll_ms: default_watchdog_ready_poll_ms(),
            freeze_timeout_ms: default_freeze_timeout_ms(),
            freeze_poll_ms: default_freeze_poll_ms(),
            seed_online_attempts: default_seed_online_attempts(),
            seed_online_interval_ms: default_seed_online_interval_ms(),
        }
    }
}

impl Timings {
    pub fn abort_window(&self) -> Duration {
        Duration::from_millis(self.abort_window_ms)
    }

    pub fn task_poll(&self) -> Duration {
        Duration::from_millis(self.task_poll_ms)
    }

    pub fn watchdog_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_ready_timeout_ms)
    }

    pub fn watchdog_ready_poll(&self) -> Duration {
        Duration::from_millis(self.watchdog_ready_poll_ms)
    }

    pub fn freeze_timeout(&self) -> Duration {
        Duration::from_millis(self.freeze_timeout_ms)
    }

    pub fn freeze_poll(&self) -> Duration {
        Duration::from_millis(self.freeze_poll_ms)
    }

    pub fn seed_online_interval(&self) -> Duration {
        Duration::from_millis(self.seed_online_interval_ms)
    }

    /// Zero-length waits, used by tests driving fake environments.
    pub fn immediate() -> Self {
        Self {
            abort_window_ms: 0,
            task_poll_ms: 0,
            watchdog_ready_timeout_ms: 50,
            watchdog_ready_poll_ms: 0,
            freeze_timeout_ms: 50,
            freeze_poll_ms: 0,
            seed_online_attempts: 3,
            seed_online_interval_ms: 0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backup_dir: default_backup_dir(),
            project: None,
            k8s_namespace: None,
            log: LogConfig::default(),
            neo4j: Neo4jConfig::default(),
            postgres: PostgresConfig::default(),
            timings: Timings::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise start from defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            project = "infrahub-prod"

            [timings]
            task_poll_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.project.as_deref(), Some("infrahub-prod"));
        assert_eq!(config.backup_dir, PathBuf::from("./infrahub_backups"));
        assert_eq!(config.timings.task_poll(), Duration::from_millis(250));
        assert_eq!(config.timings.freeze_timeout(), Duration::from_secs(120));
        assert_eq!(config.log.format, LogFormat::Text);
    }

    #[test]
    fn test_from_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ops.toml");
        std::fs::write(
            &path,
            "backup_dir = \"/srv/backups\"\n[log]\nformat = \"json\"\n[neo4j]\nusername = \"admin\"\n",
        )?;

        let config = Config::from_file(&path)?;
        assert_eq!(config.backup_dir, PathBuf::from("/srv/backups"));
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.neo4j.username.as_deref(), Some("admin"));
        assert!(config.neo4j.password.is_none());
        Ok(())
    }
}
