//! Metadata Log Network Protocol
//!
//! Endpoints and DTOs for the replicated log: leader election, log
//! replication, snapshot install, client submission and view reads. All
//! control messages are JSON over the raft port.

use serde::{Deserialize, Serialize};

use super::types::{FileMeta, LogEntry, LogRecord, ShardMeta};
use crate::membership::types::NodeId;

// --- API Endpoints ---

pub const ENDPOINT_APPEND_ENTRIES: &str = "/raft/append_entries";
pub const ENDPOINT_REQUEST_VOTE: &str = "/raft/request_vote";
pub const ENDPOINT_INSTALL_SNAPSHOT: &str = "/raft/install_snapshot";
/// Client-facing append; only the leader accepts it.
pub const ENDPOINT_SUBMIT: &str = "/log/submit";
pub const ENDPOINT_LEADER: &str = "/log/leader";
/// Materialized-view reads; any replica may serve them.
pub const ENDPOINT_VIEW_FILE: &str = "/log/view/file";
pub const ENDPOINT_VIEW_LIST: &str = "/log/view/list";
pub const ENDPOINT_VIEW_SHARDS: &str = "/log/view/shards";
pub const ENDPOINT_VIEW_MAX_SHARD: &str = "/log/view/max_shard";
pub const ENDPOINT_METRICS: &str = "/metrics";

// --- Data Transfer Objects ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Receiver's last log index; lets the leader back off in one hop.
    pub last_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: NodeId,
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Full materialized state; file metadata is small enough to ship whole.
    pub files: Vec<FileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Idempotency key: resubmitting the same op_id never duplicates the
    /// record.
    pub op_id: String,
    pub record: LogRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub committed: bool,
    pub index: Option<u64>,
    /// Where to retry when this replica is not the leader.
    pub leader_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub leader: Option<String>,
    pub term: u64,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponse {
    pub file: Option<FileMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardsResponse {
    pub shards: Vec<ShardMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaxShardResponse {
    pub max_shard_id: u64,
}
