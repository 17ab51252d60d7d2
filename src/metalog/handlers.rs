//! Metadata Log API Handlers
//!
//! Axum endpoints served on each participant's raft port: the raft RPCs,
//! client submission, and materialized-view reads.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::protocol::{
    AppendEntriesRequest, FileResponse, InstallSnapshotRequest, LeaderResponse, ListResponse,
    MaxShardResponse, RequestVoteRequest, ShardsResponse, SubmitRequest, SubmitResponse,
    ENDPOINT_APPEND_ENTRIES, ENDPOINT_INSTALL_SNAPSHOT, ENDPOINT_LEADER, ENDPOINT_METRICS,
    ENDPOINT_REQUEST_VOTE, ENDPOINT_SUBMIT, ENDPOINT_VIEW_MAX_SHARD, ENDPOINT_VIEW_SHARDS,
};
use super::raft::RaftNode;
use crate::error::ClusterError;
use crate::metrics::Metrics;

pub fn router(raft: Arc<RaftNode>, metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route(ENDPOINT_APPEND_ENTRIES, post(handle_append_entries))
        .route(ENDPOINT_REQUEST_VOTE, post(handle_request_vote))
        .route(ENDPOINT_INSTALL_SNAPSHOT, post(handle_install_snapshot))
        .route(ENDPOINT_SUBMIT, post(handle_submit))
        .route(ENDPOINT_LEADER, get(handle_leader))
        .route("/log/view/file/:owner/:name", get(handle_view_file))
        .route("/log/view/list/:owner", get(handle_view_list))
        .route(ENDPOINT_VIEW_SHARDS, get(handle_view_shards))
        .route(ENDPOINT_VIEW_MAX_SHARD, get(handle_view_max_shard))
        .route(ENDPOINT_METRICS, get(crate::metrics::handle_metrics))
        .layer(Extension(raft))
        .layer(Extension(metrics))
}

async fn handle_append_entries(
    Extension(raft): Extension<Arc<RaftNode>>,
    Json(req): Json<AppendEntriesRequest>,
) -> impl IntoResponse {
    Json(raft.handle_append_entries(req))
}

async fn handle_request_vote(
    Extension(raft): Extension<Arc<RaftNode>>,
    Json(req): Json<RequestVoteRequest>,
) -> impl IntoResponse {
    Json(raft.handle_request_vote(req))
}

async fn handle_install_snapshot(
    Extension(raft): Extension<Arc<RaftNode>>,
    Json(req): Json<InstallSnapshotRequest>,
) -> impl IntoResponse {
    Json(raft.handle_install_snapshot(req))
}

async fn handle_submit(
    Extension(raft): Extension<Arc<RaftNode>>,
    Json(req): Json<SubmitRequest>,
) -> Response {
    match raft.submit(req.op_id, req.record).await {
        Ok(index) => Json(SubmitResponse {
            committed: true,
            index: Some(index),
            leader_hint: None,
        })
        .into_response(),
        Err(ClusterError::LeaderChanged { hint }) => (
            StatusCode::MISDIRECTED_REQUEST,
            Json(SubmitResponse {
                committed: false,
                index: None,
                leader_hint: hint,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Log submit failed: {}", e);
            e.into_response()
        }
    }
}

async fn handle_leader(Extension(raft): Extension<Arc<RaftNode>>) -> Json<LeaderResponse> {
    Json(raft.leader_info())
}

async fn handle_view_file(
    Extension(raft): Extension<Arc<RaftNode>>,
    Path((owner, name)): Path<(String, String)>,
) -> Json<FileResponse> {
    let view = raft.view_snapshot();
    Json(FileResponse {
        file: view.file(&owner, &name).cloned(),
    })
}

async fn handle_view_list(
    Extension(raft): Extension<Arc<RaftNode>>,
    Path(owner): Path<String>,
) -> Json<ListResponse> {
    Json(ListResponse {
        files: raft.view_snapshot().list(&owner),
    })
}

async fn handle_view_shards(Extension(raft): Extension<Arc<RaftNode>>) -> Json<ShardsResponse> {
    Json(ShardsResponse {
        shards: raft.view_snapshot().all_shards(),
    })
}

async fn handle_view_max_shard(
    Extension(raft): Extension<Arc<RaftNode>>,
) -> Json<MaxShardResponse> {
    Json(MaxShardResponse {
        max_shard_id: raft.view_snapshot().max_shard_id(),
    })
}
