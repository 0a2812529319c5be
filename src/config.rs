//! WolfElect Configuration
//!
//! This module provides configuration structures for a WolfElect node.
//! Every field has a default, so a node can run without any file at all
//! using the conventional port layout (`base + id`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::state::NodeId;

/// Main WolfElect configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ElectConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Cluster membership configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Failure detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Election engine configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Query responder configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default = "default_node_id")]
    pub id: NodeId,

    /// Start believing this node is already the leader
    #[serde(default)]
    pub bootstrap_leader: bool,

    /// Host used when endpoints are derived from the base ports
    #[serde(default = "default_host")]
    pub host: String,
}

/// Cluster membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of nodes when identifiers are derived (`1..=size`)
    #[serde(default = "default_cluster_size")]
    pub size: u64,

    /// Coordination channel port for node `i` is `coordination_base_port + i`
    #[serde(default = "default_coordination_base_port")]
    pub coordination_base_port: u16,

    /// Query channel port for node `i` is `query_base_port + i`
    #[serde(default = "default_query_base_port")]
    pub query_base_port: u16,

    /// Explicit membership entries (overrides the derived layout)
    #[serde(default)]
    pub nodes: Vec<MemberConfig>,
}

/// An explicitly configured cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: NodeId,
    pub coordination_address: String,
    pub query_address: String,
}

/// Failure detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Interval between leader probes in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Time to wait for a probe acknowledgement in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive missed probes before a peer is declared dead
    #[serde(default = "default_max_missed_probes")]
    pub max_missed_probes: u32,

    /// Non-leader peers are probed every this many ticks
    #[serde(default = "default_peer_probe_every")]
    pub peer_probe_every: u64,
}

/// Election engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Collection phase gives up after this long without progress
    #[serde(default = "default_collection_timeout_ms")]
    pub collection_timeout_ms: u64,
}

/// What a query answers while no leader is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryPolicy {
    /// Wait for resolution, bounded by `wait_timeout_ms`
    Block,
    /// Answer the unknown marker immediately
    Sentinel,
}

/// Wire encoding of the leader identifier in query responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderEncoding {
    /// Decimal text
    Ascii,
    /// A single raw byte
    Byte,
}

/// Query responder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_policy")]
    pub policy: QueryPolicy,

    /// Upper bound on how long a blocked query waits in milliseconds
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Blocked queries held at once; further ones are answered immediately
    #[serde(default = "default_max_waiting")]
    pub max_waiting: usize,

    #[serde(default = "default_leader_encoding")]
    pub encoding: LeaderEncoding,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_node_id() -> NodeId {
    1
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cluster_size() -> u64 {
    5
}

fn default_coordination_base_port() -> u16 {
    10000
}

fn default_query_base_port() -> u16 {
    5000
}

fn default_probe_interval_ms() -> u64 {
    250
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_max_missed_probes() -> u32 {
    3
}

fn default_peer_probe_every() -> u64 {
    4
}

fn default_collection_timeout_ms() -> u64 {
    1500
}

fn default_query_policy() -> QueryPolicy {
    QueryPolicy::Block
}

fn default_wait_timeout_ms() -> u64 {
    5000
}

fn default_max_waiting() -> usize {
    256
}

fn default_leader_encoding() -> LeaderEncoding {
    LeaderEncoding::Ascii
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            bootstrap_leader: false,
            host: default_host(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            size: default_cluster_size(),
            coordination_base_port: default_coordination_base_port(),
            query_base_port: default_query_base_port(),
            nodes: Vec::new(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_missed_probes: default_max_missed_probes(),
            peer_probe_every: default_peer_probe_every(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            collection_timeout_ms: default_collection_timeout_ms(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            policy: default_query_policy(),
            wait_timeout_ms: default_wait_timeout_ms(),
            max_waiting: default_max_waiting(),
            encoding: default_leader_encoding(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl DetectorConfig {
    /// Get probe interval as Duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Get probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl ElectionConfig {
    /// Get collection timeout as Duration
    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }
}

impl QueryConfig {
    /// Get the blocking query bound as Duration
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

impl ElectConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ElectConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Identifiers of every cluster member, ascending
    pub fn member_ids(&self) -> Vec<NodeId> {
        if self.cluster.nodes.is_empty() {
            (1..=self.cluster.size).collect()
        } else {
            let mut ids: Vec<NodeId> = self.cluster.nodes.iter().map(|n| n.id).collect();
            ids.sort_unstable();
            ids
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        let ids = self.member_ids();

        if ids.is_empty() {
            return Err(crate::Error::Config("cluster has no members".into()));
        }

        if ids.contains(&0) {
            return Err(crate::Error::Config(
                "node identifier 0 is reserved for the unknown leader marker".into(),
            ));
        }

        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(crate::Error::Config("duplicate node identifiers".into()));
        }

        if !ids.contains(&self.node.id) {
            return Err(crate::Error::UnknownNode(self.node.id));
        }

        if self.cluster.nodes.is_empty() {
            let highest = self.cluster.size;
            for (name, base) in [
                ("coordination_base_port", self.cluster.coordination_base_port),
                ("query_base_port", self.cluster.query_base_port),
            ] {
                if u64::from(base) + highest > u64::from(u16::MAX) {
                    return Err(crate::Error::Config(format!(
                        "cluster.{} {} + {} exceeds the port range",
                        name, base, highest
                    )));
                }
            }
        }

        if self.query.encoding == LeaderEncoding::Byte && ids.iter().any(|&id| id > 255) {
            return Err(crate::Error::Config(
                "byte encoding requires identifiers up to 255".into(),
            ));
        }

        if self.detector.probe_interval_ms == 0 || self.detector.probe_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "detector intervals must be positive".into(),
            ));
        }

        if self.query.max_waiting == 0 {
            return Err(crate::Error::Config(
                "query.max_waiting must be at least 1".into(),
            ));
        }

        if self.detector.max_missed_probes == 0 {
            return Err(crate::Error::Config(
                "detector.max_missed_probes must be at least 1".into(),
            ));
        }

        if self.detector.peer_probe_every == 0 {
            return Err(crate::Error::Config(
                "detector.peer_probe_every must be at least 1".into(),
            ));
        }

        if self.election.collection_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "election.collection_timeout_ms must be positive".into(),
            ));
        }

        Ok(())
    }
}
