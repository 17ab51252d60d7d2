//! Cluster configuration document.
//!
//! One JSON file describes the whole cluster: the node roster plus the global
//! tunables. Every process (coordinator and nodes) loads the same document,
//! so placement, replication and membership all start from an identical view.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, Result};

/// One storage node in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
    pub server_port: u16,
    pub raft_port: u16,
    /// Bootstrap hint: this node starts an election first.
    #[serde(default)]
    pub primary: bool,
}

impl NodeConfig {
    /// `host:port` of the chunk server; doubles as the node id.
    pub fn chunk_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.server_port)
    }

    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.raft_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
    /// Address the coordinator binds to (`host:port`).
    pub super_node_address: String,

    #[serde(default = "defaults::lru_capacity")]
    pub lru_capacity: usize,
    /// Chunk size for uploads, in bytes.
    #[serde(default = "defaults::upload_shard_size")]
    pub upload_shard_size: usize,
    #[serde(default = "defaults::replication_factor")]
    pub replication_factor: usize,
    #[serde(default = "defaults::min_replicas")]
    pub min_replicas: usize,
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before a node turns Suspect.
    #[serde(default = "defaults::suspect_threshold")]
    pub suspect_threshold: u32,
    /// Time in Suspect before a node is declared Dead, in milliseconds.
    #[serde(default = "defaults::dead_threshold_ms")]
    pub dead_threshold_ms: u64,
    /// Request-handling concurrency per process. Required: an undersized
    /// default has bitten this system's lineage before, so the operator must
    /// state the expected concurrency explicitly.
    pub worker_pool_size: usize,
    /// Fraction of the disk budget a node may fill before PutChunk starts
    /// failing with OutOfSpace.
    #[serde(default = "defaults::disk_high_water")]
    pub disk_high_water: f64,
    /// Writeback queue depth past which read-miss admissions bypass the cache.
    #[serde(default = "defaults::writeback_high_water")]
    pub writeback_high_water: usize,
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,
}

mod defaults {
    use std::path::PathBuf;

    pub fn lru_capacity() -> usize {
        10_000
    }
    pub fn upload_shard_size() -> usize {
        50 * 1024 * 1024
    }
    pub fn replication_factor() -> usize {
        2
    }
    pub fn min_replicas() -> usize {
        1
    }
    pub fn heartbeat_interval_ms() -> u64 {
        1_000
    }
    pub fn suspect_threshold() -> u32 {
        3
    }
    pub fn dead_threshold_ms() -> u64 {
        10_000
    }
    pub fn disk_high_water() -> f64 {
        0.9
    }
    pub fn writeback_high_water() -> usize {
        512
    }
    pub fn data_dir() -> PathBuf {
        PathBuf::from("./data")
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(ClusterError::Config("empty node roster".into()));
        }
        if self.worker_pool_size == 0 {
            return Err(ClusterError::Config(
                "worker_pool_size must be at least 1".into(),
            ));
        }
        if self.upload_shard_size == 0 {
            return Err(ClusterError::Config(
                "upload_shard_size must be positive".into(),
            ));
        }
        if self.min_replicas == 0 || self.min_replicas > self.replication_factor {
            return Err(ClusterError::Config(
                "require 1 <= min_replicas <= replication_factor".into(),
            ));
        }
        if self.replication_factor > self.nodes.len() {
            return Err(ClusterError::Config(format!(
                "replication_factor {} exceeds roster size {}",
                self.replication_factor,
                self.nodes.len()
            )));
        }
        if !(0.0..=1.0).contains(&self.disk_high_water) {
            return Err(ClusterError::Config(
                "disk_high_water must be within [0, 1]".into(),
            ));
        }
        let mut addrs: Vec<String> = self.nodes.iter().map(|n| n.chunk_addr()).collect();
        addrs.sort();
        addrs.dedup();
        if addrs.len() != self.nodes.len() {
            return Err(ClusterError::Config(
                "duplicate node addresses in roster".into(),
            ));
        }
        Ok(())
    }

    /// Look up a roster entry by its chunk address.
    pub fn find_node(&self, chunk_addr: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.chunk_addr() == chunk_addr)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dead_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.dead_threshold_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ClusterConfig {
        serde_json::from_value(serde_json::json!({
            "nodes": [
                { "hostname": "127.0.0.1", "server_port": 9001, "raft_port": 7001, "primary": true },
                { "hostname": "127.0.0.1", "server_port": 9002, "raft_port": 7002 },
                { "hostname": "127.0.0.1", "server_port": 9003, "raft_port": 7003 }
            ],
            "super_node_address": "127.0.0.1:9000",
            "worker_pool_size": 200
        }))
        .unwrap()
    }

    #[test]
    fn defaults_applied() {
        let config = base_config();
        assert_eq!(config.lru_capacity, 10_000);
        assert_eq!(config.upload_shard_size, 50 * 1024 * 1024);
        assert_eq!(config.replication_factor, 2);
        assert_eq!(config.suspect_threshold, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pool_size_is_required() {
        let result: std::result::Result<ClusterConfig, _> =
            serde_json::from_value(serde_json::json!({
                "nodes": [
                    { "hostname": "127.0.0.1", "server_port": 9001, "raft_port": 7001 }
                ],
                "super_node_address": "127.0.0.1:9000"
            }));
        assert!(result.is_err(), "missing worker_pool_size must not parse");
    }

    #[test]
    fn zero_pool_rejected() {
        let mut config = base_config();
        config.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn replication_factor_bounded_by_roster() {
        let mut config = base_config();
        config.replication_factor = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_addresses_rejected() {
        let mut config = base_config();
        config.nodes[1].server_port = 9001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn node_addresses() {
        let config = base_config();
        assert_eq!(config.nodes[0].chunk_addr(), "127.0.0.1:9001");
        assert_eq!(config.nodes[0].raft_addr(), "127.0.0.1:7001");
        assert!(config.find_node("127.0.0.1:9002").is_some());
        assert!(config.find_node("127.0.0.1:9999").is_none());
    }
}
