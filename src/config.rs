//! Configuration: YAML file plus environment overrides.
//!
//! Search order: explicit path, `$TASK_BOARD_CONFIG`, `task-board/config.yaml`
//! in the working directory, then `~/.task-board/config.yaml`. The first file
//! found wins; with none the defaults apply. Environment overrides are
//! applied last.

use crate::retry::{RetryPolicies, RetryPolicy};
use crate::router::AgentCapability;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_CONFIG_PATH: &str = "TASK_BOARD_CONFIG";
pub const ENV_DB_PATH: &str = "TASK_BOARD_DB_PATH";
pub const ENV_LEASE_SECONDS: &str = "TASK_BOARD_LEASE_SECONDS";
pub const ENV_SWEEP_INTERVAL_SECONDS: &str = "TASK_BOARD_SWEEP_INTERVAL_SECONDS";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub leases: LeaseConfig,
    pub retry: RetryConfig,
    pub events: EventsConfig,
    /// Capabilities registered with the router at startup.
    pub agents: Vec<AgentCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".task-board/tasks.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub default_lease_seconds: u64,
    pub sweep_interval_seconds: u64,
    /// Cap applied to list queries that give no limit.
    pub list_limit: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: 300,
            sweep_interval_seconds: 30,
            list_limit: crate::db::tasks::DEFAULT_LIST_LIMIT,
        }
    }
}

impl LeaseConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_secs(self.default_lease_seconds)
    }

    /// Sweep period, never zero.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub default: RetryPolicy,
    /// Explicit per-category policies. Categories not listed use `default`.
    pub categories: HashMap<String, RetryPolicy>,
}

impl RetryConfig {
    pub fn policies(&self) -> RetryPolicies {
        RetryPolicies::with_categories(self.default.clone(), self.categories.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Parse a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty file parses as null; treat it as all defaults.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Resolve and load configuration, then apply environment overrides.
    ///
    /// An explicitly named file must exist; discovered locations are optional.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from));

        let (mut config, source) = match explicit {
            Some(path) => (Self::load(&path)?, Some(path)),
            None => match Self::candidate_paths().into_iter().find(|p| p.is_file()) {
                Some(path) => (Self::load(&path)?, Some(path)),
                None => (Self::default(), None),
            },
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        debug!(source = ?source, db_path = %config.server.db_path.display(), "configuration loaded");
        Ok((config, source))
    }

    /// Discovered config locations, in priority order.
    pub fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("task-board").join("config.yaml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".task-board").join("config.yaml"));
        }
        paths
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db_path) = lookup(ENV_DB_PATH) {
            self.server.db_path = PathBuf::from(db_path);
        }
        if let Some(raw) = lookup(ENV_LEASE_SECONDS) {
            self.leases.default_lease_seconds = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a number of seconds, got '{}'", ENV_LEASE_SECONDS, raw))?;
        }
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_SECONDS) {
            self.leases.sweep_interval_seconds = raw.trim().parse().with_context(|| {
                format!("{} must be a number of seconds, got '{}'", ENV_SWEEP_INTERVAL_SECONDS, raw)
            })?;
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.db_path, PathBuf::from(".task-board/tasks.db"));
        assert_eq!(config.leases.default_lease(), Duration::from_secs(300));
        assert_eq!(config.leases.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.leases.list_limit, 500);
        assert_eq!(config.events.capacity, 1024);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config = Config::from_yaml(
            r#"
leases:
  default_lease_seconds: 60
retry:
  categories:
    deploy:
      max_attempts: 1
      escalate: true
agents:
  - worker_id: bot-a
    categories: [bug, "*"]
    max_concurrent: 2
    priority: 5
"#,
        )
        .unwrap();

        assert_eq!(config.leases.default_lease_seconds, 60);
        assert_eq!(config.leases.sweep_interval_seconds, 30);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].max_concurrent, 2);

        let policies = config.retry.policies();
        assert_eq!(policies.get_policy("deploy").max_attempts, 1);
        assert_eq!(policies.get_policy("bug").max_attempts, 3);
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = Config::from_yaml("  \n").unwrap();
        assert_eq!(config.leases.default_lease_seconds, 300);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| match key {
                ENV_DB_PATH => Some("/tmp/board.db".to_string()),
                ENV_LEASE_SECONDS => Some("45".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.db_path, PathBuf::from("/tmp/board.db"));
        assert_eq!(config.leases.default_lease_seconds, 45);
        assert_eq!(config.leases.sweep_interval_seconds, 30);
    }

    #[test]
    fn malformed_env_number_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|key| (key == ENV_SWEEP_INTERVAL_SECONDS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_SWEEP_INTERVAL_SECONDS));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server:\n  db_path: custom.db\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.db_path, PathBuf::from("custom.db"));
    }
}
