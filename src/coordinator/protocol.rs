//! Coordinator Network Protocol
//!
//! Client-facing endpoints and DTOs. The external web layer adapts these to
//! HTTP for browsers; internally they are the cluster's upload/download API.

use serde::{Deserialize, Serialize};

use crate::membership::types::NodeStatus;

// --- API Endpoints ---

/// File operations nest under `/files/:owner[/:name]`.
pub const ENDPOINT_FILES: &str = "/files";
pub const ENDPOINT_STATUS: &str = "/status";
pub const ENDPOINT_METRICS: &str = "/metrics";

// --- Data Transfer Objects ---

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub owner: String,
    pub name: String,
    pub size: u64,
    pub shards: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub owner: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub id: String,
    pub status: NodeStatus,
    pub cpu: f32,
    pub disk_used: u64,
    pub disk_capacity: u64,
    pub shard_count: u64,
}

/// Cluster status document: active node list with per-node load, aggregate
/// cache hit rate, and the current metadata leader.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub nodes: Vec<NodeStatusInfo>,
    pub active_nodes: usize,
    pub total_nodes: usize,
    pub leader: Option<String>,
    pub cache_hit_rate: f64,
}
