//! Placement & Load Scoring
//!
//! Picks which nodes host each shard. Candidates are scored from the load
//! vector their last heartbeat reported; lower is better. Selection is
//! deterministic: ties break on node id, so repeated runs over the same
//! membership snapshot pick the same nodes.

use std::collections::HashSet;

use crate::error::{ClusterError, Result};
use crate::membership::types::{LoadVector, NodeId, NodeRecord, NodeStatus};

const CPU_WEIGHT: f64 = 0.5;
const DISK_WEIGHT: f64 = 0.3;
const SHARD_WEIGHT: f64 = 0.2;

/// Drop nodes whose disk sits at or past the high-water mark: their
/// `PutChunk` would answer `OutOfSpace` anyway, so they are ineligible for
/// new placement until the pressure clears. Nodes without a known capacity
/// are kept.
pub fn eligible(snapshot: &[NodeRecord], disk_high_water: f64) -> Vec<NodeRecord> {
    snapshot
        .iter()
        .filter(|n| n.load.disk_capacity == 0 || n.load.disk_ratio() < disk_high_water)
        .cloned()
        .collect()
}

/// Composite load score in [0, 1]; lower means a better placement target.
pub fn load_score(load: &LoadVector, max_shard_count: u64) -> f64 {
    let shard_ratio = if max_shard_count == 0 {
        0.0
    } else {
        load.shard_count as f64 / max_shard_count as f64
    };
    CPU_WEIGHT * load.cpu as f64 + DISK_WEIGHT * load.disk_ratio() + SHARD_WEIGHT * shard_ratio
}

/// Select the replica set for one shard: the `replicas` lowest-scored Active
/// nodes, excluding `exclude` (nodes that already hold the shard). At least
/// `min_replicas` candidates must be available or the placement fails.
pub fn select_replicas(
    snapshot: &[NodeRecord],
    replicas: usize,
    min_replicas: usize,
    exclude: &HashSet<NodeId>,
) -> Result<Vec<NodeId>> {
    let candidates: Vec<&NodeRecord> = snapshot
        .iter()
        .filter(|n| n.status == NodeStatus::Active && !exclude.contains(&n.id))
        .collect();

    if candidates.len() < min_replicas {
        return Err(ClusterError::InsufficientCapacity {
            needed: min_replicas,
            available: candidates.len(),
        });
    }

    let max_shard_count = candidates
        .iter()
        .map(|n| n.load.shard_count)
        .max()
        .unwrap_or(0);

    let mut scored: Vec<(f64, &NodeRecord)> = candidates
        .into_iter()
        .map(|n| (load_score(&n.load, max_shard_count), n))
        .collect();
    scored.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });

    Ok(scored
        .into_iter()
        .take(replicas)
        .map(|(_, n)| n.id.clone())
        .collect())
}

/// Order a shard's replica set by current load, liveness first. Used by
/// downloads to try the cheapest live replica before falling back.
pub fn order_replicas_by_load(snapshot: &[NodeRecord], replicas: &[NodeId]) -> Vec<NodeId> {
    let max_shard_count = snapshot
        .iter()
        .map(|n| n.load.shard_count)
        .max()
        .unwrap_or(0);

    let mut live: Vec<(f64, NodeId)> = Vec::new();
    let mut rest: Vec<NodeId> = Vec::new();

    for id in replicas {
        match snapshot.iter().find(|n| &n.id == id) {
            Some(record) if record.status == NodeStatus::Active => {
                live.push((load_score(&record.load, max_shard_count), id.clone()));
            }
            _ => rest.push(id.clone()),
        }
    }

    live.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });

    let mut ordered: Vec<NodeId> = live.into_iter().map(|(_, id)| id).collect();
    // Non-Active replicas go last: they may still answer while the detector
    // hasn't caught up, and a download should exhaust every option.
    ordered.extend(rest);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::NodeRecord;

    fn record(port: u16, status: NodeStatus, cpu: f32, shard_count: u64) -> NodeRecord {
        let mut n = NodeRecord::new(NodeId(format!("127.0.0.1:{port}")));
        n.status = status;
        n.load = LoadVector {
            cpu,
            disk_used: 50,
            disk_capacity: 100,
            shard_count,
        };
        n
    }

    fn id(port: u16) -> NodeId {
        NodeId(format!("127.0.0.1:{port}"))
    }

    #[test]
    fn picks_lowest_scored_nodes() {
        let snapshot = vec![
            record(9001, NodeStatus::Active, 0.9, 10),
            record(9002, NodeStatus::Active, 0.1, 10),
            record(9003, NodeStatus::Active, 0.5, 10),
        ];
        let picked = select_replicas(&snapshot, 2, 1, &HashSet::new()).unwrap();
        assert_eq!(picked, vec![id(9002), id(9003)]);
    }

    #[test]
    fn only_active_nodes_are_candidates() {
        let snapshot = vec![
            record(9001, NodeStatus::Active, 0.9, 0),
            record(9002, NodeStatus::Suspect, 0.0, 0),
            record(9003, NodeStatus::Dead, 0.0, 0),
            record(9004, NodeStatus::Joining, 0.0, 0),
        ];
        let picked = select_replicas(&snapshot, 2, 1, &HashSet::new()).unwrap();
        assert_eq!(picked, vec![id(9001)]);
    }

    #[test]
    fn deterministic_tie_break_by_node_id() {
        let snapshot = vec![
            record(9003, NodeStatus::Active, 0.5, 10),
            record(9001, NodeStatus::Active, 0.5, 10),
            record(9002, NodeStatus::Active, 0.5, 10),
        ];
        let picked = select_replicas(&snapshot, 2, 1, &HashSet::new()).unwrap();
        assert_eq!(picked, vec![id(9001), id(9002)]);
    }

    #[test]
    fn no_duplicates_in_replica_set() {
        let snapshot = vec![
            record(9001, NodeStatus::Active, 0.1, 0),
            record(9002, NodeStatus::Active, 0.2, 0),
        ];
        let picked = select_replicas(&snapshot, 3, 1, &HashSet::new()).unwrap();
        let mut deduped = picked.clone();
        deduped.dedup();
        assert_eq!(picked, deduped);
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn insufficient_capacity_when_below_min() {
        let snapshot = vec![record(9001, NodeStatus::Suspect, 0.1, 0)];
        let err = select_replicas(&snapshot, 2, 1, &HashSet::new()).unwrap_err();
        match err {
            ClusterError::InsufficientCapacity { needed, available } => {
                assert_eq!(needed, 1);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exclusion_removes_existing_replicas() {
        let snapshot = vec![
            record(9001, NodeStatus::Active, 0.1, 0),
            record(9002, NodeStatus::Active, 0.2, 0),
        ];
        let exclude: HashSet<NodeId> = [id(9001)].into_iter().collect();
        let picked = select_replicas(&snapshot, 1, 1, &exclude).unwrap();
        assert_eq!(picked, vec![id(9002)]);
    }

    #[test]
    fn score_uses_all_three_components() {
        let idle = LoadVector {
            cpu: 0.0,
            disk_used: 0,
            disk_capacity: 100,
            shard_count: 0,
        };
        let busy = LoadVector {
            cpu: 1.0,
            disk_used: 100,
            disk_capacity: 100,
            shard_count: 10,
        };
        assert_eq!(load_score(&idle, 10), 0.0);
        assert!((load_score(&busy, 10) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_max_shard_count_does_not_divide_by_zero() {
        let load = LoadVector::default();
        assert_eq!(load_score(&load, 0), 0.0);
    }

    #[test]
    fn full_nodes_are_ineligible() {
        let mut full = record(9001, NodeStatus::Active, 0.1, 0);
        full.load.disk_used = 95;
        let mut unknown = record(9002, NodeStatus::Active, 0.1, 0);
        unknown.load.disk_capacity = 0;
        let roomy = record(9003, NodeStatus::Active, 0.1, 0);

        let kept = eligible(&[full, unknown, roomy], 0.9);
        let ids: Vec<NodeId> = kept.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![id(9002), id(9003)]);
    }

    #[test]
    fn download_ordering_prefers_live_low_load() {
        let snapshot = vec![
            record(9001, NodeStatus::Active, 0.9, 5),
            record(9002, NodeStatus::Active, 0.1, 5),
            record(9003, NodeStatus::Dead, 0.0, 5),
        ];
        let replicas = vec![id(9001), id(9002), id(9003)];
        let ordered = order_replicas_by_load(&snapshot, &replicas);
        assert_eq!(ordered, vec![id(9002), id(9001), id(9003)]);
    }
}
