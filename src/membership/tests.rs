use std::time::{Duration, Instant};

use crate::membership::service::{ClusterView, Transition};
use crate::membership::types::{LoadVector, NodeId, NodeStatus};

const SUSPECT_THRESHOLD: u32 = 3;
const DEAD_THRESHOLD: Duration = Duration::from_secs(10);

fn node(n: u16) -> NodeId {
    NodeId(format!("127.0.0.1:{}", 9000 + n))
}

fn view_of(count: u16) -> ClusterView {
    ClusterView::new((1..=count).map(node))
}

fn load(cpu: f32) -> LoadVector {
    LoadVector {
        cpu,
        disk_used: 10,
        disk_capacity: 100,
        shard_count: 5,
    }
}

#[test]
fn configured_nodes_start_joining() {
    let view = view_of(3);
    assert_eq!(view.len(), 3);
    assert!(view.active().is_empty());
    for record in view.snapshot() {
        assert_eq!(record.status, NodeStatus::Joining);
    }
}

#[test]
fn first_heartbeat_activates() {
    let view = view_of(1);
    let t = view.record_success(&node(1), load(0.2), Instant::now());
    assert_eq!(t, Some(Transition::Joined));
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Active);
    assert_eq!(view.active_count(), 1);
}

#[test]
fn one_miss_short_of_threshold_stays_active() {
    let view = view_of(1);
    let now = Instant::now();
    view.record_success(&node(1), load(0.1), now);

    for _ in 0..SUSPECT_THRESHOLD - 1 {
        let t = view.record_failure(&node(1), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
        assert_eq!(t, None);
    }
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Active);
}

#[test]
fn threshold_misses_suspect() {
    let view = view_of(1);
    let now = Instant::now();
    view.record_success(&node(1), load(0.1), now);

    let mut last = None;
    for _ in 0..SUSPECT_THRESHOLD {
        last = view.record_failure(&node(1), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    }
    assert_eq!(last, Some(Transition::Suspected));
    let record = view.get(&node(1)).unwrap();
    assert_eq!(record.status, NodeStatus::Suspect);
    assert!(record.suspect_since.is_some());
}

#[test]
fn suspect_turns_dead_after_window() {
    let view = view_of(1);
    let start = Instant::now();
    view.record_success(&node(1), load(0.1), start);
    for _ in 0..SUSPECT_THRESHOLD {
        view.record_failure(&node(1), start, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    }

    // Still inside the dead window: no transition.
    let t = view.record_failure(
        &node(1),
        start + Duration::from_secs(5),
        SUSPECT_THRESHOLD,
        DEAD_THRESHOLD,
    );
    assert_eq!(t, None);
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Suspect);

    let t = view.record_failure(
        &node(1),
        start + DEAD_THRESHOLD,
        SUSPECT_THRESHOLD,
        DEAD_THRESHOLD,
    );
    assert_eq!(t, Some(Transition::Died));
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Dead);
}

#[test]
fn dead_node_recovers_on_first_success() {
    let view = view_of(1);
    let start = Instant::now();
    view.record_success(&node(1), load(0.1), start);
    for _ in 0..SUSPECT_THRESHOLD {
        view.record_failure(&node(1), start, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    }
    view.record_failure(&node(1), start + DEAD_THRESHOLD, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Dead);

    let t = view.record_success(&node(1), load(0.5), start + DEAD_THRESHOLD);
    assert_eq!(t, Some(Transition::Recovered));
    let record = view.get(&node(1)).unwrap();
    assert_eq!(record.status, NodeStatus::Active);
    assert_eq!(record.consecutive_misses, 0);
    assert!(record.suspect_since.is_none());
}

#[test]
fn success_resets_miss_counter() {
    let view = view_of(1);
    let now = Instant::now();
    view.record_success(&node(1), load(0.1), now);
    view.record_failure(&node(1), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    view.record_failure(&node(1), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    view.record_success(&node(1), load(0.1), now);

    // The counter started over, so the threshold is a fresh run of misses.
    for _ in 0..SUSPECT_THRESHOLD - 1 {
        assert_eq!(
            view.record_failure(&node(1), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD),
            None
        );
    }
    assert_eq!(view.get(&node(1)).unwrap().status, NodeStatus::Active);
}

#[test]
fn active_excludes_suspect_and_dead() {
    let view = view_of(3);
    let now = Instant::now();
    view.record_success(&node(1), load(0.1), now);
    view.record_success(&node(2), load(0.2), now);
    view.record_success(&node(3), load(0.3), now);

    for _ in 0..SUSPECT_THRESHOLD {
        view.record_failure(&node(3), now, SUSPECT_THRESHOLD, DEAD_THRESHOLD);
    }

    let active: Vec<NodeId> = view.active().into_iter().map(|n| n.id).collect();
    assert_eq!(active.len(), 2);
    assert!(!active.contains(&node(3)));
}

#[test]
fn heartbeat_updates_load() {
    let view = view_of(1);
    let now = Instant::now();
    view.record_success(&node(1), load(0.1), now);
    view.record_success(&node(1), load(0.9), now);
    let record = view.get(&node(1)).unwrap();
    assert!((record.load.cpu - 0.9).abs() < f32::EPSILON);
}
