//! Cluster error taxonomy.
//!
//! Every failure the core can produce is one of these closed kinds. Handlers
//! map kinds to HTTP status codes; internal callers match on kinds to decide
//! between retry, fallback and surfacing.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("digest mismatch for shard {shard}: expected {expected}, computed {computed}")]
    DigestMismatch {
        shard: u64,
        expected: String,
        computed: String,
    },

    #[error("insufficient capacity: {available} active node(s), {needed} required")]
    InsufficientCapacity { needed: usize, available: usize },

    #[error("out of space: {used} of {limit} byte budget used")]
    OutOfSpace { used: u64, limit: u64 },

    #[error("deadline exceeded talking to {0}")]
    Timeout(String),

    #[error("not the metadata leader (hint: {hint:?})")]
    LeaderChanged { hint: Option<String> },

    #[error("shard {0} unavailable on every replica")]
    DataUnavailable(u64),

    #[error("operation cancelled")]
    Cancelled,

    #[error("zero-byte upload rejected")]
    EmptyFile,

    #[error("file already exists: {owner}/{name}")]
    FileExists { owner: String, name: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ClusterError {
    /// Stable short name, used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::NotFound(_) => "not_found",
            ClusterError::DigestMismatch { .. } => "digest_mismatch",
            ClusterError::InsufficientCapacity { .. } => "insufficient_capacity",
            ClusterError::OutOfSpace { .. } => "out_of_space",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::LeaderChanged { .. } => "leader_changed",
            ClusterError::DataUnavailable(_) => "data_unavailable",
            ClusterError::Cancelled => "cancelled",
            ClusterError::EmptyFile => "empty_file",
            ClusterError::FileExists { .. } => "file_exists",
            ClusterError::Config(_) => "config",
            ClusterError::Io(_) => "io",
            ClusterError::Codec(_) => "codec",
            ClusterError::Json(_) => "json",
            ClusterError::Rpc(_) => "rpc",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ClusterError::NotFound(_) => StatusCode::NOT_FOUND,
            ClusterError::DigestMismatch { .. } => StatusCode::PRECONDITION_FAILED,
            ClusterError::InsufficientCapacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::OutOfSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
            ClusterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ClusterError::LeaderChanged { .. } => StatusCode::MISDIRECTED_REQUEST,
            ClusterError::DataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ClusterError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ClusterError::EmptyFile => StatusCode::BAD_REQUEST,
            ClusterError::FileExists { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ClusterError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
