//! Storage Node Network Protocol
//!
//! Endpoints and DTOs for the chunk RPC surface. Chunk bodies travel as raw
//! `application/octet-stream` with the shard id in the path and the SHA-256
//! digest in a header; control messages are JSON.

use serde::{Deserialize, Serialize};

use crate::membership::types::{LoadVector, NodeId};
use crate::metalog::types::ShardId;

// --- API Endpoints ---

/// Chunk data plane. `PUT/GET/DELETE /chunk/:shard_id`.
pub const ENDPOINT_CHUNK: &str = "/chunk";
/// Digest probe: `GET /chunk/:shard_id/digest`.
pub const ENDPOINT_CHUNK_DIGEST_SUFFIX: &str = "/digest";
/// Load report polled by the coordinator's failure detector.
pub const ENDPOINT_HEARTBEAT: &str = "/heartbeat";
/// Pull-replication: the target node fetches a shard from a source node.
pub const ENDPOINT_REPLICATE: &str = "/replicate";
/// Node-local cache/storage statistics.
pub const ENDPOINT_STATS: &str = "/stats";
/// Prometheus text exposition.
pub const ENDPOINT_METRICS: &str = "/metrics";

/// Header carrying the hex SHA-256 of a chunk body.
pub const DIGEST_HEADER: &str = "x-shard-digest";

// --- Data Transfer Objects ---

/// Standard acknowledgment for chunk operations.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Reply to a heartbeat poll: the node's current load vector.
#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub load: LoadVector,
}

/// Instruction to pull a shard from another node and store it locally.
/// Issued by the coordinator's replication worker.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub shard_id: ShardId,
    /// Node currently holding a healthy copy.
    pub source: NodeId,
    /// Expected content digest, verified after the pull.
    pub digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DigestResponse {
    pub shard_id: ShardId,
    pub digest: String,
}

/// Node statistics surfaced to the coordinator's status document.
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatsResponse {
    pub node_id: String,
    pub cache_size: usize,
    pub cache_capacity: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub writeback_depth: usize,
    pub shard_count: u64,
    pub disk_used: u64,
    pub disk_capacity: u64,
}
