//! Coordinator API Handlers
//!
//! Axum endpoints for the client-facing file operations. Uploads stream the
//! request body through the sharding pipeline; downloads stream shards back
//! in order as they are fetched from replicas. File routes sit behind the
//! bounded concurrency pool.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Extension, Path};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::Semaphore;

use super::protocol::{
    ExistsResponse, ListFilesResponse, StatusResponse, ENDPOINT_METRICS, ENDPOINT_STATUS,
};
use super::service::Coordinator;
use crate::metrics::Metrics;
use crate::node::protocol::Ack;
use crate::rpc::acquire_permit;

pub fn router(
    coordinator: Arc<Coordinator>,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
) -> Router {
    let files = Router::new()
        .route(
            "/files/:owner/:name",
            post(handle_upload)
                .put(handle_replace)
                .get(handle_download)
                .delete(handle_delete),
        )
        .route("/files/:owner/:name/exists", get(handle_exists))
        .route("/files/:owner", get(handle_list))
        // Uploads are arbitrarily large and consumed as a stream, one chunk
        // buffered at a time.
        .layer(DefaultBodyLimit::disable())
        .layer(axum::middleware::from_fn_with_state(permits, acquire_permit));

    Router::new()
        .merge(files)
        .route(ENDPOINT_STATUS, get(handle_status))
        .route(ENDPOINT_METRICS, get(crate::metrics::handle_metrics))
        .layer(Extension(coordinator))
        .layer(Extension(metrics))
}

async fn handle_upload(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((owner, name)): Path<(String, String)>,
    body: Body,
) -> Response {
    match coordinator
        .upload(&owner, &name, body.into_data_stream())
        .await
    {
        Ok(reply) => (StatusCode::CREATED, Json(reply)).into_response(),
        Err(e) => {
            tracing::error!("Upload {}/{} failed: {}", owner, name, e);
            e.into_response()
        }
    }
}

async fn handle_replace(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((owner, name)): Path<(String, String)>,
    body: Body,
) -> Response {
    match coordinator
        .replace(&owner, &name, body.into_data_stream())
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(e) => {
            tracing::error!("Replace {}/{} failed: {}", owner, name, e);
            e.into_response()
        }
    }
}

async fn handle_download(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    let file = match coordinator.lookup(&owner, &name).await {
        Ok(file) => file,
        Err(e) => return e.into_response(),
    };

    let mut shards = file.shards.clone();
    shards.sort_by_key(|s| s.seq);

    // Fetch the first shard eagerly so replica exhaustion still surfaces as
    // a proper error status instead of a truncated stream.
    let mut iter = shards.into_iter();
    let first = match iter.next() {
        Some(shard) => match coordinator.fetch_shard(&shard).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Download {}/{} failed: {}", owner, name, e);
                return e.into_response();
            }
        },
        None => bytes::Bytes::new(),
    };
    coordinator.record_download();

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<bytes::Bytes>>(4);
    let feeder = coordinator.clone();
    tokio::spawn(async move {
        if tx.send(Ok(first)).await.is_err() {
            return;
        }
        for shard in iter {
            match feeder.fetch_shard(&shard).await {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("Download stream lost shard {}: {}", shard.id, e);
                    let _ = tx
                        .send(Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            e.to_string(),
                        )))
                        .await;
                    return;
                }
            }
        }
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(stream).into_response()
}

async fn handle_delete(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    match coordinator.delete(&owner, &name).await {
        Ok(()) => (StatusCode::OK, Json(Ack::ok("deleted"))).into_response(),
        Err(e) => {
            tracing::error!("Delete {}/{} failed: {}", owner, name, e);
            e.into_response()
        }
    }
}

async fn handle_exists(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path((owner, name)): Path<(String, String)>,
) -> Response {
    match coordinator.exists(&owner, &name).await {
        Ok(exists) => Json(ExistsResponse { exists }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_list(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(owner): Path<String>,
) -> Response {
    match coordinator.list(&owner).await {
        Ok(files) => Json(ListFilesResponse { owner, files }).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_status(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Json<StatusResponse> {
    Json(coordinator.status().await)
}
