use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::types::{LoadVector, NodeId, NodeRecord, NodeStatus};
use crate::metrics::Metrics;
use crate::node::protocol::{HeartbeatResponse, ENDPOINT_HEARTBEAT};
use crate::rpc::RpcClient;

/// Heartbeat polls use a short deadline so a slow node is demoted quickly.
const HEARTBEAT_DEADLINE: Duration = Duration::from_millis(200);

/// State change produced by a heartbeat observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Joined,
    Recovered,
    Suspected,
    Died,
}

/// The coordinator's view of cluster membership.
///
/// Reader-writer locked: the failure detector is the only writer, everyone
/// else (placement, repair, status) reads snapshots.
pub struct ClusterView {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl ClusterView {
    /// Seed the view from the configured roster. Nodes start Joining and
    /// become Active on their first heartbeat reply.
    pub fn new(roster: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes = roster
            .into_iter()
            .map(|id| (id.clone(), NodeRecord::new(id)))
            .collect();
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let guard = self.nodes.read().expect("membership lock poisoned");
        guard.values().cloned().collect()
    }

    /// Nodes currently eligible for placement.
    pub fn active(&self) -> Vec<NodeRecord> {
        let guard = self.nodes.read().expect("membership lock poisoned");
        guard
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        let guard = self.nodes.read().expect("membership lock poisoned");
        guard.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("membership lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a successful heartbeat. A node in any non-Active state becomes
    /// Active on its first reply; a recovered node does not reclaim shard
    /// ownership, it only becomes a candidate for new placement again.
    pub fn record_success(
        &self,
        id: &NodeId,
        load: LoadVector,
        now: Instant,
    ) -> Option<Transition> {
        let mut guard = self.nodes.write().expect("membership lock poisoned");
        let record = guard.entry(id.clone()).or_insert_with(|| NodeRecord::new(id.clone()));
        record.last_seen = Some(now);
        record.consecutive_misses = 0;
        record.suspect_since = None;
        record.load = load;

        match record.status {
            NodeStatus::Active => None,
            NodeStatus::Joining => {
                record.status = NodeStatus::Active;
                Some(Transition::Joined)
            }
            NodeStatus::Suspect | NodeStatus::Dead => {
                record.status = NodeStatus::Active;
                Some(Transition::Recovered)
            }
        }
    }

    /// Apply a failed heartbeat poll.
    pub fn record_failure(
        &self,
        id: &NodeId,
        now: Instant,
        suspect_threshold: u32,
        dead_threshold: Duration,
    ) -> Option<Transition> {
        let mut guard = self.nodes.write().expect("membership lock poisoned");
        let record = guard.get_mut(id)?;
        record.consecutive_misses = record.consecutive_misses.saturating_add(1);

        match record.status {
            NodeStatus::Active if record.consecutive_misses >= suspect_threshold => {
                record.status = NodeStatus::Suspect;
                record.suspect_since = Some(now);
                Some(Transition::Suspected)
            }
            NodeStatus::Suspect => {
                let since = record.suspect_since.unwrap_or(now);
                if now.duration_since(since) >= dead_threshold {
                    record.status = NodeStatus::Dead;
                    Some(Transition::Died)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn active_count(&self) -> usize {
        let guard = self.nodes.read().expect("membership lock poisoned");
        guard
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .count()
    }
}

/// Pull-model failure detector: the coordinator polls every known node's
/// heartbeat endpoint on a fixed interval and drives the
/// Active/Suspect/Dead state machine from the results.
pub struct FailureDetector {
    view: Arc<ClusterView>,
    rpc: Arc<RpcClient>,
    metrics: Arc<Metrics>,
    interval: Duration,
    suspect_threshold: u32,
    dead_threshold: Duration,
}

impl FailureDetector {
    pub fn new(
        view: Arc<ClusterView>,
        rpc: Arc<RpcClient>,
        metrics: Arc<Metrics>,
        interval: Duration,
        suspect_threshold: u32,
        dead_threshold: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            view,
            rpc,
            metrics,
            interval,
            suspect_threshold,
            dead_threshold,
        })
    }

    pub async fn run(self: Arc<Self>) {
        info!("Failure detector started ({:?} interval)", self.interval);
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    pub async fn poll_once(&self) {
        let ids: Vec<NodeId> = self.view.snapshot().into_iter().map(|n| n.id).collect();

        let polls = ids.iter().map(|id| self.poll_node(id.clone()));
        futures::future::join_all(polls).await;

        self.metrics
            .active_nodes
            .set(self.view.active_count() as u64);
        self.metrics.total_nodes.set(self.view.len() as u64);
    }

    async fn poll_node(&self, id: NodeId) {
        self.metrics.heartbeat_checks.inc();
        let url = format!("http://{}{}", id, ENDPOINT_HEARTBEAT);
        let now = Instant::now();

        let load = match self.rpc.get(url, HEARTBEAT_DEADLINE, 1).await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<HeartbeatResponse>().await {
                    Ok(beat) => Some(beat.load),
                    Err(_) => None,
                }
            }
            _ => None,
        };

        match load {
            Some(load) => {
                match self.view.record_success(&id, load, now) {
                    Some(Transition::Joined) => {
                        info!("Node {} joined the cluster", id);
                    }
                    Some(Transition::Recovered) => {
                        info!("Node {} recovered, eligible for placement again", id);
                        self.metrics.node_recoveries.inc();
                    }
                    _ => {}
                }
            }
            None => {
                self.metrics.heartbeat_failures.inc();
                match self.view.record_failure(
                    &id,
                    now,
                    self.suspect_threshold,
                    self.dead_threshold,
                ) {
                    Some(Transition::Suspected) => {
                        warn!("Node {} suspected (missed {} heartbeats)", id, self.suspect_threshold);
                    }
                    Some(Transition::Died) => {
                        warn!("Node {} declared DEAD", id);
                        self.metrics.node_failures.inc();
                    }
                    _ => {}
                }
            }
        }
    }
}
