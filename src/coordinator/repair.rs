//! Replication (repair) worker.
//!
//! A single long-running loop that scans the committed metadata for shards
//! whose live replica count has fallen below the replication factor, pulls a
//! fresh copy onto a placement-selected target, and records the new replica
//! in the log. Failures back off exponentially per shard; repeated runs are
//! idempotent because the log submission key is derived from the repair
//! itself.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::membership::service::ClusterView;
use crate::membership::types::{NodeId, NodeStatus};
use crate::metalog::client::MetaClient;
use crate::metalog::types::{LogRecord, ShardId, ShardMeta};
use crate::metrics::Metrics;
use crate::node::protocol::{Ack, ReplicateRequest, ENDPOINT_REPLICATE};
use crate::placement::{eligible, order_replicas_by_load, select_replicas};
use crate::rpc::RpcClient;

const REPAIR_POLL_INTERVAL: Duration = Duration::from_secs(2);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const REPLICATE_DEADLINE: Duration = Duration::from_secs(30);

struct BackoffState {
    attempts: u32,
    next_attempt: Instant,
}

pub struct ReplicationWorker {
    view: Arc<ClusterView>,
    meta: Arc<MetaClient>,
    rpc: Arc<RpcClient>,
    metrics: Arc<Metrics>,
    replication_factor: usize,
    disk_high_water: f64,
    backoff: DashMap<ShardId, BackoffState>,
    shutdown: watch::Receiver<bool>,
}

impl ReplicationWorker {
    pub fn new(
        view: Arc<ClusterView>,
        meta: Arc<MetaClient>,
        rpc: Arc<RpcClient>,
        metrics: Arc<Metrics>,
        replication_factor: usize,
        disk_high_water: f64,
    ) -> (Arc<Self>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Arc::new(Self {
                view,
                meta,
                rpc,
                metrics,
                replication_factor,
                disk_high_water,
                backoff: DashMap::new(),
                shutdown: rx,
            }),
            tx,
        )
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Replication worker started (target replica count {})",
            self.replication_factor
        );
        let mut ticker = tokio::time::interval(REPAIR_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if *self.shutdown.borrow() {
                info!("Replication worker shutting down");
                return;
            }
            match self.scan_once().await {
                Ok(0) => {}
                Ok(repaired) => info!("Repaired {} shard(s)", repaired),
                Err(e) => debug!("Repair scan skipped: {}", e),
            }
        }
    }

    /// One full pass over the committed shard set. Returns the number of
    /// replicas successfully created. Cancellation is honored between
    /// shards, never mid-transfer.
    pub async fn scan_once(&self) -> Result<usize> {
        let shards = self.meta.all_shards().await?;
        let snapshot = self.view.snapshot();
        let active: HashSet<NodeId> = snapshot
            .iter()
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| n.id.clone())
            .collect();

        let mut repaired = 0usize;
        for shard in shards {
            if *self.shutdown.borrow() {
                break;
            }

            let live: Vec<NodeId> = shard
                .replicas
                .iter()
                .filter(|r| active.contains(r))
                .cloned()
                .collect();

            if live.len() >= self.replication_factor {
                self.backoff.remove(&shard.id);
                continue;
            }
            if live.is_empty() {
                warn!(
                    "Shard {} has no live replicas; repair impossible until one returns",
                    shard.id
                );
                continue;
            }
            if let Some(state) = self.backoff.get(&shard.id) {
                if Instant::now() < state.next_attempt {
                    continue;
                }
            }

            match self.repair_shard(&shard, &live, &snapshot).await {
                Ok(target) => {
                    self.backoff.remove(&shard.id);
                    self.metrics.replication_success.inc();
                    info!("Shard {} re-replicated onto {}", shard.id, target);
                    repaired += 1;
                }
                Err(e) => {
                    self.metrics.replication_failures.inc();
                    let attempts = self
                        .backoff
                        .get(&shard.id)
                        .map(|s| s.attempts + 1)
                        .unwrap_or(1);
                    let delay = backoff_delay(attempts);
                    warn!(
                        "Repair of shard {} failed (attempt {}): {}; next try in {:?}",
                        shard.id, attempts, e, delay
                    );
                    self.backoff.insert(
                        shard.id,
                        BackoffState {
                            attempts,
                            next_attempt: Instant::now() + delay,
                        },
                    );
                }
            }
        }
        Ok(repaired)
    }

    async fn repair_shard(
        &self,
        shard: &ShardMeta,
        live: &[NodeId],
        snapshot: &[crate::membership::types::NodeRecord],
    ) -> Result<NodeId> {
        // Healthiest source first; designated replicas are excluded from the
        // target choice even when they are currently down.
        let source = order_replicas_by_load(snapshot, live)
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::Rpc("no live source".into()))?;
        let exclude: HashSet<NodeId> = shard.replicas.iter().cloned().collect();
        let pool = eligible(snapshot, self.disk_high_water);
        let target = select_replicas(&pool, 1, 1, &exclude)?
            .into_iter()
            .next()
            .ok_or(ClusterError::InsufficientCapacity {
                needed: 1,
                available: 0,
            })?;

        self.metrics.replication_attempts.inc();
        let url = format!("http://{}{}", target, ENDPOINT_REPLICATE);
        let request = ReplicateRequest {
            shard_id: shard.id,
            source: source.clone(),
            digest: shard.digest.clone(),
        };
        let response = self
            .rpc
            .post_json(url, &request, REPLICATE_DEADLINE, 1)
            .await?;
        if !response.status().is_success() {
            return Err(ClusterError::Rpc(format!(
                "ReplicateFrom on {target}: {}",
                response.status()
            )));
        }
        let ack: Ack = response
            .json()
            .await
            .map_err(|e| ClusterError::Rpc(format!("replicate ack: {e}")))?;
        if !ack.success {
            return Err(ClusterError::Rpc(format!(
                "ReplicateFrom on {target}: {}",
                ack.message
            )));
        }

        // Deterministic op id: re-running the same repair is a log no-op.
        let op_id = format!("repair-{}-{}", shard.id, target);
        self.meta
            .submit(
                &op_id,
                &LogRecord::ShardReplicaAdd {
                    shard: shard.id,
                    node: target.clone(),
                },
            )
            .await?;
        Ok(target)
    }
}

fn backoff_delay(attempts: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempts.min(7).saturating_sub(1));
    exp.min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_to_cap() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }
}
