//! Storage Node API Handlers
//!
//! Axum endpoints exposing the `NodeService` to the network. Chunk bodies
//! are raw bytes; everything else is JSON. The data-plane routes sit behind
//! the bounded concurrency pool; heartbeat and metrics answer outside it so
//! the failure detector's short deadline is never starved by chunk I/O.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tokio::sync::Semaphore;

use super::protocol::{
    Ack, DigestResponse, HeartbeatResponse, ReplicateRequest, DIGEST_HEADER, ENDPOINT_HEARTBEAT,
    ENDPOINT_METRICS, ENDPOINT_REPLICATE, ENDPOINT_STATS,
};
use super::service::NodeService;
use crate::metalog::types::ShardId;
use crate::metrics::Metrics;
use crate::rpc::acquire_permit;

pub fn router(
    service: Arc<NodeService>,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
    max_body_bytes: usize,
) -> Router {
    let data_plane = Router::new()
        .route(
            "/chunk/:shard_id",
            put(handle_put_chunk)
                .get(handle_get_chunk)
                .delete(handle_delete_chunk),
        )
        .route("/chunk/:shard_id/digest", get(handle_digest))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(permits, acquire_permit));

    Router::new()
        .merge(data_plane)
        .route(ENDPOINT_HEARTBEAT, get(handle_heartbeat))
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_METRICS, get(crate::metrics::handle_metrics))
        .layer(Extension(service))
        .layer(Extension(metrics))
}

async fn handle_put_chunk(
    Extension(service): Extension<Arc<NodeService>>,
    Path(shard_id): Path<u64>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(digest) = headers.get(DIGEST_HEADER).and_then(|v| v.to_str().ok()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(Ack {
                success: false,
                message: format!("missing {DIGEST_HEADER} header"),
            }),
        )
            .into_response();
    };

    match service.put_chunk(ShardId(shard_id), body, digest).await {
        Ok(()) => (StatusCode::OK, Json(Ack::ok("stored"))).into_response(),
        Err(e) => {
            tracing::error!("PutChunk {} failed: {}", shard_id, e);
            e.into_response()
        }
    }
}

async fn handle_get_chunk(
    Extension(service): Extension<Arc<NodeService>>,
    Path(shard_id): Path<u64>,
) -> Response {
    match service.get_chunk(ShardId(shard_id)).await {
        Ok(bytes) => {
            let digest = super::store::digest_hex(&bytes);
            ([(DIGEST_HEADER, digest)], bytes).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_delete_chunk(
    Extension(service): Extension<Arc<NodeService>>,
    Path(shard_id): Path<u64>,
) -> Response {
    match service.delete_chunk(ShardId(shard_id)).await {
        Ok(removed) => {
            let message = if removed { "deleted" } else { "already absent" };
            (StatusCode::OK, Json(Ack::ok(message))).into_response()
        }
        Err(e) => {
            tracing::error!("DeleteChunk {} failed: {}", shard_id, e);
            e.into_response()
        }
    }
}

async fn handle_digest(
    Extension(service): Extension<Arc<NodeService>>,
    Path(shard_id): Path<u64>,
) -> Response {
    match service.digest(ShardId(shard_id)).await {
        Ok(digest) => Json(DigestResponse {
            shard_id: ShardId(shard_id),
            digest,
        })
        .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_replicate(
    Extension(service): Extension<Arc<NodeService>>,
    Json(req): Json<ReplicateRequest>,
) -> Response {
    match service
        .replicate_from(req.shard_id, &req.source, &req.digest)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(Ack::ok("replicated"))).into_response(),
        Err(e) => {
            tracing::error!(
                "ReplicateFrom {} <- {} failed: {}",
                req.shard_id,
                req.source,
                e
            );
            e.into_response()
        }
    }
}

async fn handle_heartbeat(Extension(service): Extension<Arc<NodeService>>) -> Json<HeartbeatResponse> {
    Json(HeartbeatResponse {
        load: service.heartbeat(),
    })
}

async fn handle_stats(
    Extension(service): Extension<Arc<NodeService>>,
) -> Json<super::protocol::NodeStatsResponse> {
    Json(service.stats())
}
