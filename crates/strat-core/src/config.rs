//! Node configuration (`stratgrid.toml`).
//!
//! Every field has a default so a node can boot from an empty file:
//!
//! ```toml
//! [store]
//! endpoints = ["10.0.0.10:2379", "10.0.0.11:2379"]
//!
//! [node]
//! advertise_address = "10.0.0.21:7000"
//! strategy_kinds = ["grid", "dca"]
//!
//! [supervisor]
//! runner_program = "/usr/local/bin/stratd"
//! runner_args = ["runner"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub node: NodeSection,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub agent: AgentConfig,
}

/// Where the coordination store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Remote store addresses (`host:port`). Empty means an embedded,
    /// in-process store.
    pub endpoints: Vec<String>,
    /// Data directory for the embedded store.
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            data_dir: PathBuf::from("/var/lib/stratgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Address other nodes use to reach this node's HTTP listener.
    /// Defaults to `127.0.0.1:{port}` when unset.
    pub advertise_address: Option<String>,
    /// Strategy kinds this node can execute. Empty means scheduler-only.
    pub strategy_kinds: Vec<String>,
    /// Directory for per-task control sockets.
    pub socket_dir: PathBuf,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            advertise_address: None,
            strategy_kinds: Vec::new(),
            socket_dir: std::env::temp_dir().join("stratgrid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether this node campaigns for scheduler leadership.
    pub enabled: bool,
    pub election_name: String,
    /// Upper bound for a single store call during reconciliation.
    pub op_timeout_ms: u64,
    /// TTL of the leadership lease.
    pub leader_lease_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            election_name: "scheduler".to_string(),
            op_timeout_ms: 10_000,
            leader_lease_ttl_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn leader_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program launched for every task. Defaults to the current executable.
    pub runner_program: Option<PathBuf>,
    pub runner_args: Vec<String>,
    /// Fixed delay between StartStrategy attempts.
    pub start_retry_ms: u64,
    /// Fixed delay before respawning a dead process.
    pub restart_backoff_ms: u64,
    /// Timeout for one control-channel round trip.
    pub command_timeout_ms: u64,
    /// TTL of the running-marker lease.
    pub lease_ttl_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runner_program: None,
            runner_args: vec!["runner".to_string()],
            start_retry_ms: 500,
            restart_backoff_ms: 1_000,
            command_timeout_ms: 5_000,
            lease_ttl_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// TTL of the worker-registration lease.
    pub registration_ttl_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registration_ttl_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.op_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.op_timeout_ms must be positive".to_string(),
            ));
        }
        if self.supervisor.lease_ttl_secs == 0 || self.agent.registration_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lease TTLs must be positive".to_string()));
        }
        if let Some(kind) = self
            .node
            .strategy_kinds
            .iter()
            .find(|k| k.is_empty() || k.contains('/'))
        {
            return Err(ConfigError::Invalid(format!(
                "strategy kind {kind:?} must be non-empty and contain no '/'"
            )));
        }
        Ok(())
    }

    /// The address this node registers under.
    pub fn advertise_address(&self, port: u16) -> String {
        self.node
            .advertise_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = NodeConfig::from_toml_str("").unwrap();
        assert!(config.store.endpoints.is_empty());
        assert!(config.scheduler.enabled);
        assert_eq!(config.scheduler.op_timeout(), Duration::from_secs(10));
        assert_eq!(config.supervisor.start_retry_ms, 500);
        assert_eq!(config.supervisor.runner_args, vec!["runner".to_string()]);
        assert_eq!(config.advertise_address(7000), "127.0.0.1:7000");
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[store]
endpoints = ["10.0.0.10:2379", "10.0.0.11:2379"]

[node]
advertise_address = "10.0.0.21:7000"
strategy_kinds = ["grid", "dca"]
socket_dir = "/run/stratgrid"

[scheduler]
enabled = false
op_timeout_ms = 2500

[supervisor]
runner_program = "/usr/local/bin/stratd"
restart_backoff_ms = 250
"#;
        let config = NodeConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.node.strategy_kinds, vec!["grid", "dca"]);
        assert_eq!(config.node.socket_dir, PathBuf::from("/run/stratgrid"));
        assert!(!config.scheduler.enabled);
        assert_eq!(config.scheduler.op_timeout(), Duration::from_millis(2500));
        assert_eq!(config.supervisor.restart_backoff_ms, 250);
        assert_eq!(config.supervisor.start_retry_ms, 500);
        assert_eq!(config.advertise_address(7000), "10.0.0.21:7000");
    }

    #[test]
    fn rejects_strategy_kind_with_separator() {
        let err = NodeConfig::from_toml_str("[node]\nstrategy_kinds = [\"grid/v2\"]\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = NodeConfig::from_toml_str("[scheduler]\nop_timeout_ms = 0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = NodeConfig::from_file(Path::new("/nonexistent/stratgrid.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/stratgrid.toml"));
    }
}
