use serde::{Deserialize, Serialize};
use std::fmt;

use crate::membership::types::NodeId;

/// Globally unique shard identifier. Assigned by the coordinator from a
/// monotone counter seeded off the metadata view, so ids never collide even
/// across coordinator restarts.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One shard of a file: a fixed-size contiguous slice of its bytes, the unit
/// of placement and replication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardMeta {
    pub id: ShardId,
    /// Position within the parent file.
    pub seq: u32,
    pub len: u64,
    /// Hex SHA-256 of the shard bytes.
    pub digest: String,
    /// Nodes designated to hold this shard. May temporarily differ from the
    /// set of nodes that actually have the bytes while repair is in flight.
    pub replicas: Vec<NodeId>,
}

/// File-level metadata. Immutable once written except whole-file replace and
/// delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    pub owner: String,
    pub name: String,
    pub size: u64,
    pub created_at_ms: u64,
    pub chunk_size: u64,
    pub shards: Vec<ShardMeta>,
}

/// A record in the replicated metadata log. The log is the source of truth;
/// the in-memory view is a materialization of its committed prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogRecord {
    FilePut {
        file: FileMeta,
    },
    FileDelete {
        owner: String,
        name: String,
    },
    ShardReplicaAdd {
        shard: ShardId,
        node: NodeId,
    },
    ShardReplicaRemove {
        shard: ShardId,
        node: NodeId,
    },
}

/// A log record wrapped with its raft position and idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    /// 1-based position in the log.
    pub index: u64,
    /// Client-supplied key; the leader drops duplicate submissions.
    pub op_id: String,
    pub record: LogRecord,
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
