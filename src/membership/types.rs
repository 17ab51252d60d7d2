use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Unique identifier for a node in the cluster: the `host:port` of its chunk
/// server. Stable across restarts, unlike a random id, so a node that comes
/// back keeps its shard memberships.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a node from the perspective of the failure detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    /// Configured but never heard from.
    Joining,
    /// Healthy and responsive; eligible for placement.
    Active,
    /// Missed the heartbeat window; excluded from new placement but its
    /// replica memberships are retained until repaired.
    Suspect,
    /// Confirmed failed. Never removed from the map, only revived by a
    /// successful heartbeat.
    Dead,
}

/// Load sample reported by a node's heartbeat, used for placement scoring.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadVector {
    /// CPU utilization in [0, 1].
    pub cpu: f32,
    pub disk_used: u64,
    pub disk_capacity: u64,
    pub shard_count: u64,
}

impl LoadVector {
    pub fn disk_ratio(&self) -> f64 {
        if self.disk_capacity == 0 {
            0.0
        } else {
            self.disk_used as f64 / self.disk_capacity as f64
        }
    }
}

/// A single member of the cluster as tracked by the coordinator.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub status: NodeStatus,
    pub load: LoadVector,
    /// Local timestamp of the last successful heartbeat.
    pub last_seen: Option<Instant>,
    pub consecutive_misses: u32,
    /// When the node entered Suspect; drives the Dead transition.
    pub suspect_since: Option<Instant>,
}

impl NodeRecord {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Joining,
            load: LoadVector::default(),
            last_seen: None,
            consecutive_misses: 0,
            suspect_since: None,
        }
    }
}
