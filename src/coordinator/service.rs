use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use super::protocol::{NodeStatusInfo, StatusResponse, UploadResponse};
use super::sharding::Chunker;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::membership::service::ClusterView;
use crate::membership::types::{NodeId, NodeStatus};
use crate::metalog::client::MetaClient;
use crate::metalog::types::{now_ms, FileMeta, LogRecord, ShardId, ShardMeta};
use crate::metrics::Metrics;
use crate::node::protocol::{NodeStatsResponse, DIGEST_HEADER, ENDPOINT_CHUNK, ENDPOINT_STATS};
use crate::node::store::digest_hex;
use crate::placement::{eligible, order_replicas_by_load, select_replicas};
use crate::rpc::RpcClient;

const CHUNK_PUT_DEADLINE: Duration = Duration::from_secs(20);
const CHUNK_GET_DEADLINE: Duration = Duration::from_secs(20);
const CHUNK_DELETE_DEADLINE: Duration = Duration::from_secs(5);
const NODE_STATS_DEADLINE: Duration = Duration::from_millis(500);

/// The well-known endpoint clients speak to. Owns placement, drives the
/// upload/download pipeline, and forwards metadata writes to the current
/// log leader.
pub struct Coordinator {
    config: ClusterConfig,
    view: Arc<ClusterView>,
    meta: Arc<MetaClient>,
    rpc: Arc<RpcClient>,
    metrics: Arc<Metrics>,
    /// Monotone shard id counter; 0 means "seed from the metadata view".
    next_shard: AtomicU64,
}

impl Coordinator {
    pub fn new(
        config: ClusterConfig,
        view: Arc<ClusterView>,
        meta: Arc<MetaClient>,
        rpc: Arc<RpcClient>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            view,
            meta,
            rpc,
            metrics,
            next_shard: AtomicU64::new(0),
        })
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(e.kind());
        }
        result
    }

    /// Fresh globally unique shard id, seeded past everything the committed
    /// metadata already names.
    async fn next_shard_id(&self) -> Result<ShardId> {
        loop {
            let current = self.next_shard.load(Ordering::SeqCst);
            if current == 0 {
                let seed = self.meta.max_shard_id().await? + 1;
                let _ = self.next_shard.compare_exchange(
                    0,
                    seed,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                continue;
            }
            if self
                .next_shard
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(ShardId(current));
            }
        }
    }

    /// Upload a file: shard the stream, place each shard on the least-loaded
    /// nodes, and commit the metadata once every shard is durable. Not
    /// acknowledged until the log entry commits.
    pub async fn upload<S, E>(&self, owner: &str, name: &str, stream: S) -> Result<UploadResponse>
    where
        S: futures::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let result = self.upload_inner(owner, name, stream).await;
        self.observe(result)
    }

    async fn upload_inner<S, E>(
        &self,
        owner: &str,
        name: &str,
        mut stream: S,
    ) -> Result<UploadResponse>
    where
        S: futures::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        // Leader read: existence gates a mutation.
        if self.meta.fetch_file(owner, name, true).await?.is_some() {
            return Err(ClusterError::FileExists {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }

        let mut chunker = Chunker::new(self.config.upload_shard_size);
        let mut placed: Vec<ShardMeta> = Vec::new();
        let mut seq = 0u32;

        let outcome: Result<()> = async {
            while let Some(item) = stream.next().await {
                let data =
                    item.map_err(|e| ClusterError::Rpc(format!("upload stream: {e}")))?;
                for chunk in chunker.push(&data) {
                    let shard = self.place_and_put(chunk, seq).await?;
                    placed.push(shard);
                    seq += 1;
                }
            }
            if let Some(chunk) = chunker.finish() {
                let shard = self.place_and_put(chunk, seq).await?;
                placed.push(shard);
            }
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            self.cleanup_shards(&placed).await;
            return Err(e);
        }

        if chunker.total_len() == 0 {
            return Err(ClusterError::EmptyFile);
        }

        let file = FileMeta {
            owner: owner.to_string(),
            name: name.to_string(),
            size: chunker.total_len(),
            created_at_ms: now_ms(),
            chunk_size: self.config.upload_shard_size as u64,
            shards: placed.clone(),
        };
        let shard_count = file.shards.len();
        let size = file.size;

        let op_id = Uuid::new_v4().to_string();
        let commit = self.meta.submit(&op_id, &LogRecord::FilePut { file }).await;
        if let Err(e) = commit {
            self.cleanup_shards(&placed).await;
            return Err(e);
        }

        self.metrics.uploads.inc();
        info!(
            "Uploaded {}/{}: {} bytes in {} shard(s)",
            owner, name, size, shard_count
        );
        Ok(UploadResponse {
            owner: owner.to_string(),
            name: name.to_string(),
            size,
            shards: shard_count,
        })
    }

    /// Place one chunk on R nodes and PUT in parallel. One failed primary
    /// gets a single retry against a fresh node; a second failure aborts.
    async fn place_and_put(&self, chunk: Bytes, seq: u32) -> Result<ShardMeta> {
        let shard_id = self.next_shard_id().await?;
        let digest = digest_hex(&chunk);
        let snapshot = eligible(&self.view.snapshot(), self.config.disk_high_water);

        let targets = select_replicas(
            &snapshot,
            self.config.replication_factor,
            self.config.min_replicas,
            &HashSet::new(),
        )?;
        for target in &targets {
            self.metrics.record_placement(target.as_str());
        }
        self.metrics.shards_created.inc();
        self.metrics.shard_size_bytes.observe(chunk.len() as f64);

        let attempts = futures::future::join_all(targets.iter().map(|node| {
            let chunk = chunk.clone();
            let digest = digest.clone();
            async move { (node.clone(), self.put_chunk_to(node, shard_id, chunk, &digest).await) }
        }))
        .await;

        let mut replicas: Vec<NodeId> = Vec::new();
        let mut exclude: HashSet<NodeId> = targets.iter().cloned().collect();
        for (node, outcome) in attempts {
            match outcome {
                Ok(()) => replicas.push(node),
                Err(e) => {
                    warn!("PUT of shard {} to {} failed: {}; retrying on a fresh node", shard_id, node, e);
                    let fresh = select_replicas(&snapshot, 1, 1, &exclude)?;
                    let replacement = fresh
                        .first()
                        .cloned()
                        .ok_or(ClusterError::InsufficientCapacity {
                            needed: 1,
                            available: 0,
                        })?;
                    exclude.insert(replacement.clone());
                    self.metrics.record_placement(replacement.as_str());
                    self.put_chunk_to(&replacement, shard_id, chunk.clone(), &digest)
                        .await?;
                    replicas.push(replacement);
                }
            }
        }

        Ok(ShardMeta {
            id: shard_id,
            seq,
            len: chunk.len() as u64,
            digest,
            replicas,
        })
    }

    async fn put_chunk_to(
        &self,
        node: &NodeId,
        shard: ShardId,
        chunk: Bytes,
        digest: &str,
    ) -> Result<()> {
        let url = format!("http://{}{}/{}", node, ENDPOINT_CHUNK, shard);
        let response = self
            .rpc
            .put_bytes(
                url,
                chunk,
                Some((DIGEST_HEADER, digest.to_string())),
                CHUNK_PUT_DEADLINE,
            )
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClusterError::Rpc(format!(
                "PutChunk {shard} on {node}: {}",
                response.status()
            )))
        }
    }

    /// Best-effort removal of shards written before an aborted upload.
    async fn cleanup_shards(&self, placed: &[ShardMeta]) {
        for shard in placed {
            for node in &shard.replicas {
                let url = format!("http://{}{}/{}", node, ENDPOINT_CHUNK, shard.id);
                if let Err(e) = self.rpc.delete(url, CHUNK_DELETE_DEADLINE).await {
                    warn!("Cleanup of shard {} on {} failed: {}", shard.id, node, e);
                }
            }
        }
    }

    /// Metadata lookup for a download (any replica).
    pub async fn lookup(&self, owner: &str, name: &str) -> Result<FileMeta> {
        let file = self.meta.fetch_file(owner, name, false).await?;
        let found = file.ok_or_else(|| ClusterError::NotFound(format!("{owner}/{name}")));
        self.observe(found)
    }

    /// Fetch one shard from its cheapest live replica, falling back across
    /// the replica set. Exhaustion surfaces `DataUnavailable` and leaves the
    /// shortfall to the replication worker.
    pub async fn fetch_shard(&self, shard: &ShardMeta) -> Result<Bytes> {
        let snapshot = self.view.snapshot();
        let ordered = order_replicas_by_load(&snapshot, &shard.replicas);

        for node in &ordered {
            let url = format!("http://{}{}/{}", node, ENDPOINT_CHUNK, shard.id);
            match self.rpc.get(url, CHUNK_GET_DEADLINE, 1).await {
                Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                    Ok(bytes) => {
                        if digest_hex(&bytes) == shard.digest {
                            return Ok(bytes);
                        }
                        warn!("Shard {} from {} failed digest check", shard.id, node);
                    }
                    Err(e) => warn!("Shard {} body from {}: {}", shard.id, node, e),
                },
                Ok(resp) => {
                    warn!("Shard {} from {}: {}", shard.id, node, resp.status());
                }
                Err(e) => {
                    warn!("Shard {} from {}: {}", shard.id, node, e);
                }
            }
        }

        self.observe(Err(ClusterError::DataUnavailable(shard.id.0)))
    }

    pub fn record_download(&self) {
        self.metrics.downloads.inc();
    }

    /// Delete a file: the committed `FileDelete` is authoritative; chunk
    /// removal is best-effort fan-out and residual shards are collected
    /// lazily.
    pub async fn delete(&self, owner: &str, name: &str) -> Result<()> {
        let result = self.delete_inner(owner, name).await;
        self.observe(result)
    }

    async fn delete_inner(&self, owner: &str, name: &str) -> Result<()> {
        let file = self
            .meta
            .fetch_file(owner, name, true)
            .await?
            .ok_or_else(|| ClusterError::NotFound(format!("{owner}/{name}")))?;

        let op_id = Uuid::new_v4().to_string();
        self.meta
            .submit(
                &op_id,
                &LogRecord::FileDelete {
                    owner: owner.to_string(),
                    name: name.to_string(),
                },
            )
            .await?;
        self.metrics.deletes.inc();

        let rpc = self.rpc.clone();
        let shards = file.shards;
        tokio::spawn(async move {
            for shard in &shards {
                for node in &shard.replicas {
                    let url = format!("http://{}{}/{}", node, ENDPOINT_CHUNK, shard.id);
                    if let Err(e) = rpc.delete(url, CHUNK_DELETE_DEADLINE).await {
                        warn!("DeleteChunk {} on {} failed: {}", shard.id, node, e);
                    }
                }
            }
        });

        info!("Deleted {}/{}", owner, name);
        Ok(())
    }

    /// Whole-file replace: delete (when present) then upload.
    pub async fn replace<S, E>(&self, owner: &str, name: &str, stream: S) -> Result<UploadResponse>
    where
        S: futures::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        match self.delete(owner, name).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.upload(owner, name, stream).await
    }

    pub async fn exists(&self, owner: &str, name: &str) -> Result<bool> {
        Ok(self.meta.fetch_file(owner, name, false).await?.is_some())
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<String>> {
        self.meta.list_files(owner).await
    }

    /// Cluster status document: membership with load, current leader, and
    /// cache hit rate aggregated from node stats.
    pub async fn status(&self) -> StatusResponse {
        let snapshot = self.view.snapshot();
        let leader = self.meta.leader().await;

        let stats = futures::future::join_all(
            snapshot
                .iter()
                .filter(|n| n.status == NodeStatus::Active)
                .map(|n| {
                    let url = format!("http://{}{}", n.id, ENDPOINT_STATS);
                    async move {
                        match self.rpc.get(url, NODE_STATS_DEADLINE, 1).await {
                            Ok(resp) if resp.status().is_success() => {
                                resp.json::<NodeStatsResponse>().await.ok()
                            }
                            _ => None,
                        }
                    }
                }),
        )
        .await;

        let (mut hits, mut misses) = (0u64, 0u64);
        for stat in stats.into_iter().flatten() {
            hits += stat.cache_hits;
            misses += stat.cache_misses;
        }
        let cache_hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        let mut nodes: Vec<NodeStatusInfo> = snapshot
            .iter()
            .map(|n| NodeStatusInfo {
                id: n.id.to_string(),
                status: n.status,
                cpu: n.load.cpu,
                disk_used: n.load.disk_used,
                disk_capacity: n.load.disk_capacity,
                shard_count: n.load.shard_count,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        StatusResponse {
            active_nodes: nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Active)
                .count(),
            total_nodes: nodes.len(),
            nodes,
            leader,
            cache_hit_rate,
        }
    }
}
