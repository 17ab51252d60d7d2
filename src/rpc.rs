//! Shared HTTP client for inter-process RPC.
//!
//! Every outbound call carries a deadline; transient transport failures are
//! retried with exponential backoff and jitter. Status-code interpretation is
//! left to the caller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::response::IntoResponse;
use bytes::Bytes;
use serde::Serialize;

use crate::error::{ClusterError, Result};
use crate::metrics::Metrics;

pub struct RpcClient {
    http: reqwest::Client,
    metrics: Arc<Metrics>,
}

impl RpcClient {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            http: reqwest::Client::new(),
            metrics,
        }
    }

    pub async fn post_json<T: Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let started = Instant::now();
            let response = self
                .http
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;
            self.metrics
                .rpc_latency_seconds
                .observe(started.elapsed().as_secs_f64());

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(classify(&url, e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1_200);
                }
            }
        }

        Err(ClusterError::Rpc(format!("{url}: retry attempts exhausted")))
    }

    pub async fn get(
        &self,
        url: String,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let started = Instant::now();
            let response = self.http.get(url.clone()).timeout(timeout).send().await;
            self.metrics
                .rpc_latency_seconds
                .observe(started.elapsed().as_secs_f64());

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(classify(&url, e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1_200);
                }
            }
        }

        Err(ClusterError::Rpc(format!("{url}: retry attempts exhausted")))
    }

    /// Single-attempt byte upload. Chunk PUTs are retried at the placement
    /// level (fresh node), never blindly against the same target.
    pub async fn put_bytes(
        &self,
        url: String,
        body: Bytes,
        digest_header: Option<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let started = Instant::now();
        let mut req = self.http.put(url.clone()).body(body).timeout(timeout);
        if let Some((name, value)) = digest_header {
            req = req.header(name, value);
        }
        let response = req.send().await;
        self.metrics
            .rpc_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        response.map_err(|e| classify(&url, e))
    }

    pub async fn delete(&self, url: String, timeout: Duration) -> Result<reqwest::Response> {
        let started = Instant::now();
        let response = self.http.delete(url.clone()).timeout(timeout).send().await;
        self.metrics
            .rpc_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        response.map_err(|e| classify(&url, e))
    }
}

fn classify(url: &str, e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::Timeout(url.to_string())
    } else {
        ClusterError::Rpc(format!("{url}: {e}"))
    }
}

/// Server-side counterpart: bounded request concurrency. Handlers behind
/// this middleware hold one permit from the configured worker pool for the
/// duration of the request.
pub async fn acquire_permit(
    axum::extract::State(permits): axum::extract::State<Arc<tokio::sync::Semaphore>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    match permits.acquire().await {
        Ok(_permit) => next.run(request).await,
        Err(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
