use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use super::load::LoadSampler;
use super::protocol::{NodeStatsResponse, DIGEST_HEADER, ENDPOINT_CHUNK};
use super::store::ShardStore;
use crate::cache::writeback::WritebackQueue;
use crate::cache::HybridCache;
use crate::error::{ClusterError, Result};
use crate::membership::types::{LoadVector, NodeId};
use crate::metalog::types::ShardId;
use crate::metrics::Metrics;
use crate::rpc::RpcClient;

/// Deadline for pulling a shard from a peer during replication.
const REPLICATE_PULL_DEADLINE: Duration = Duration::from_secs(20);

/// One storage node: owns the local shard directory, the hybrid cache and
/// its writeback queue, and serves the chunk RPC surface.
pub struct NodeService {
    pub id: NodeId,
    store: Arc<ShardStore>,
    cache: Arc<HybridCache>,
    writeback: Arc<WritebackQueue>,
    sampler: LoadSampler,
    rpc: Arc<RpcClient>,
    metrics: Arc<Metrics>,
}

impl NodeService {
    pub fn new(
        id: NodeId,
        store: Arc<ShardStore>,
        cache: Arc<HybridCache>,
        writeback: Arc<WritebackQueue>,
        sampler: LoadSampler,
        rpc: Arc<RpcClient>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        metrics.cache_capacity.set(cache.capacity() as u64);
        Arc::new(Self {
            id,
            store,
            cache,
            writeback,
            sampler,
            rpc,
            metrics,
        })
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    /// Durable chunk write: synchronous disk path (temp + fsync + rename),
    /// then clean cache admission. Never rides the writeback queue.
    pub async fn put_chunk(&self, id: ShardId, bytes: Bytes, expected_digest: &str) -> Result<()> {
        let store = self.store.clone();
        let digest = expected_digest.to_string();
        let to_write = bytes.clone();
        let written = tokio::task::spawn_blocking(move || store.write(id, &to_write, &digest))
            .await
            .map_err(|_| ClusterError::Cancelled)?;
        self.observe(written)?;

        if let Some(evicted) = self.cache.insert(id, bytes) {
            self.drop_spills(evicted);
        }
        self.metrics.cache_size.set(self.cache.len() as u64);
        debug!("Stored shard {} ({} on disk)", id, self.store.shard_count());
        Ok(())
    }

    /// Cache hit, or disk read with cache admission through the writeback
    /// queue. Past the queue's high-water mark the read bypasses the cache
    /// and is served straight from disk.
    pub async fn get_chunk(&self, id: ShardId) -> Result<Bytes> {
        if self.cache.pin(&id) {
            let bytes = self.cache.get(&id);
            self.cache.unpin(&id);
            if let Some(bytes) = bytes {
                self.metrics.cache_hits.inc();
                return Ok(bytes);
            }
        }
        self.metrics.cache_misses.inc();

        let store = self.store.clone();
        let read = tokio::task::spawn_blocking(move || store.read(id))
            .await
            .map_err(|_| ClusterError::Cancelled)?;
        let bytes = self.observe(read)?;

        if self.writeback.should_bypass() {
            self.metrics.writeback_bypass.inc();
        } else if let Some(evicted) = self.cache.insert(id, bytes.clone()) {
            self.drop_spills(evicted);
            self.writeback.enqueue(id, bytes.clone());
            self.metrics.writeback_depth.set(self.writeback.depth() as u64);
        }
        self.metrics.cache_size.set(self.cache.len() as u64);
        Ok(bytes)
    }

    /// Idempotent delete: missing is success.
    pub async fn delete_chunk(&self, id: ShardId) -> Result<bool> {
        self.cache.remove(&id);
        self.writeback.remove_spill(id);
        self.metrics.cache_size.set(self.cache.len() as u64);

        let store = self.store.clone();
        let deleted = tokio::task::spawn_blocking(move || store.delete(id))
            .await
            .map_err(|_| ClusterError::Cancelled)?;
        self.observe(deleted)
    }

    /// Pull a shard from `source` and store it locally, verifying the
    /// expected digest end to end.
    pub async fn replicate_from(&self, id: ShardId, source: &NodeId, digest: &str) -> Result<()> {
        let url = format!("http://{}{}/{}", source, ENDPOINT_CHUNK, id);
        let response = self.rpc.get(url, REPLICATE_PULL_DEADLINE, 2).await;
        let response = self.observe(response)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return self.observe(Err(ClusterError::NotFound(format!(
                "shard {id} missing on source {source}"
            ))));
        }
        if !response.status().is_success() {
            return self.observe(Err(ClusterError::Rpc(format!(
                "replicate pull of shard {id} from {source}: {}",
                response.status()
            ))));
        }

        // Prefer the digest the source reports when the caller has none.
        let reported = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expected = if digest.is_empty() {
            reported.unwrap_or_default()
        } else {
            digest.to_string()
        };

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClusterError::Rpc(format!("replicate pull body: {e}")))?;

        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.write(id, &bytes, &expected))
            .await
            .map_err(|_| ClusterError::Cancelled)?;
        self.observe(written)?;

        self.metrics.chunks_replicated.inc();
        info!("Replicated shard {} from {}", id, source);
        Ok(())
    }

    pub async fn digest(&self, id: ShardId) -> Result<String> {
        let store = self.store.clone();
        let digest = tokio::task::spawn_blocking(move || store.digest(id))
            .await
            .map_err(|_| ClusterError::Cancelled)?;
        self.observe(digest)
    }

    pub fn heartbeat(&self) -> LoadVector {
        self.sampler.sample(&self.store)
    }

    pub fn stats(&self) -> NodeStatsResponse {
        let cache = self.cache.stats();
        NodeStatsResponse {
            node_id: self.id.to_string(),
            cache_size: cache.size,
            cache_capacity: cache.capacity,
            cache_hits: self.metrics.cache_hits.get(),
            cache_misses: self.metrics.cache_misses.get(),
            writeback_depth: self.writeback.depth(),
            shard_count: self.store.shard_count(),
            disk_used: self.store.used_bytes(),
            disk_capacity: self.store.capacity_bytes(),
        }
    }

    fn drop_spills(&self, evicted: Vec<ShardId>) {
        for shard in evicted {
            self.metrics.cache_evictions.inc();
            self.writeback.remove_spill(shard);
            debug!("Evicted shard {} from cache", shard);
        }
    }
}
