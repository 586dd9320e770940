//! mmcommit Configuration
//!
//! This module provides the configuration structures for an mmcommit node:
//! its identity, the cluster node list and the commit protocol knobs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::{NodeId, NodeMask, MAX_NODES};

/// Main mmcommit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    pub cluster: ClusterConfig,

    /// Commit protocol configuration
    #[serde(default)]
    pub commit: CommitSettings,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity (1..=64)
    pub id: NodeId,

    /// Address to bind the arbiter server on
    pub bind_address: String,

    /// Data directory for the transaction log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Node identity
    pub id: NodeId,

    /// Arbiter address (host:port)
    pub address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Every node of the cluster, this one included
    #[serde(default)]
    pub nodes: Vec<PeerConfig>,

    /// Delay between reconnect attempts to a peer in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

/// Commit protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSettings {
    /// Abort when a participant is dropped during the prepare gather.
    /// Turning it off lets the commit go on without the dropped node.
    #[serde(default = "default_true")]
    pub abort_on_prepare_drop: bool,

    /// Require a majority of the cluster to have prepared
    #[serde(default)]
    pub require_majority: bool,

    /// Outbound connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (full, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mmcommit")
}

impl Default for CommitSettings {
    fn default() -> Self {
        Self {
            abort_on_prepare_drop: true,
            require_majority: false,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CommitSettings {
    /// Get the connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl CommitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CommitConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !NodeMask::is_valid_id(self.node.id) {
            return Err(crate::Error::Config(format!(
                "node.id must be within 1..={}, got {}",
                MAX_NODES, self.node.id
            )));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.cluster.nodes {
            if !NodeMask::is_valid_id(peer.id) {
                return Err(crate::Error::Config(format!(
                    "cluster node id {} is outside 1..={}",
                    peer.id, MAX_NODES
                )));
            }
            if !seen.insert(peer.id) {
                return Err(crate::Error::Config(format!(
                    "cluster node id {} is listed twice",
                    peer.id
                )));
            }
            if peer.address.is_empty() {
                return Err(crate::Error::Config(format!(
                    "cluster node {} has an empty address",
                    peer.id
                )));
            }
        }

        if !seen.contains(&self.node.id) {
            return Err(crate::Error::Config(format!(
                "node {} is not listed in cluster.nodes",
                self.node.id
            )));
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Every cluster member except this node
    pub fn peers(&self) -> impl Iterator<Item = &PeerConfig> {
        let own = self.node.id;
        self.cluster.nodes.iter().filter(move |p| p.id != own)
    }

    /// Get the reconnect interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.reconnect_interval_ms)
    }

    /// Number of nodes forming a majority of the cluster
    pub fn majority_size(&self) -> usize {
        self.cluster.nodes.len() / 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[node]
id = 1
bind_address = "0.0.0.0:7700"
data_dir = "/var/lib/mmcommit"

[cluster]
nodes = [
    { id = 1, address = "node-1:7700" },
    { id = 2, address = "node-2:7700" },
    { id = 3, address = "node-3:7700" },
]

[commit]
require_majority = true
"#;

    #[test]
    fn test_parse_config() {
        let config = CommitConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.cluster.nodes.len(), 3);
        assert_eq!(config.peers().map(|p| p.id).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(config.majority_size(), 2);

        assert!(config.commit.require_majority);
        assert!(config.commit.abort_on_prepare_drop);
        assert_eq!(config.commit.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_interval(), Duration::from_secs(1));
        assert!(config.api.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_prepare_drop_can_be_tolerated() {
        let toml = SAMPLE.replace("[commit]\n", "[commit]\nabort_on_prepare_drop = false\n");
        let config = CommitConfig::from_str(&toml).unwrap();
        assert!(!config.commit.abort_on_prepare_drop);
        assert!(CommitSettings::default().abort_on_prepare_drop);
    }

    #[test]
    fn test_self_must_be_listed() {
        let toml = SAMPLE.replace("id = 1\n", "id = 4\n");
        let err = CommitConfig::from_str(&toml).unwrap_err();
        assert!(err.to_string().contains("not listed"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let toml = SAMPLE.replace("{ id = 3,", "{ id = 2,");
        assert!(CommitConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_node_id_range() {
        let toml = SAMPLE
            .replace("id = 1\n", "id = 65\n")
            .replace("{ id = 1,", "{ id = 65,");
        assert!(CommitConfig::from_str(&toml).is_err());
    }
}
