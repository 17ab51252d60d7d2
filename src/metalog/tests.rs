use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::error::ClusterError;
use crate::membership::types::NodeId;
use crate::metalog::protocol::{
    AppendEntriesRequest, InstallSnapshotRequest, RequestVoteRequest,
};
use crate::metalog::raft::RaftNode;
use crate::metalog::segment::{load_hard_state, save_hard_state, HardState, LogStorage};
use crate::metalog::types::{FileMeta, LogEntry, LogRecord, ShardId, ShardMeta};
use crate::metalog::view::ViewState;
use crate::metrics::Metrics;
use crate::rpc::RpcClient;

fn node_id(name: &str) -> NodeId {
    NodeId(name.to_string())
}

fn shard(id: u64, seq: u32, replicas: &[&str]) -> ShardMeta {
    ShardMeta {
        id: ShardId(id),
        seq,
        len: 100,
        digest: format!("digest-{id}"),
        replicas: replicas.iter().map(|r| node_id(r)).collect(),
    }
}

fn file(owner: &str, name: &str, shards: Vec<ShardMeta>) -> FileMeta {
    let size = shards.iter().map(|s| s.len).sum();
    FileMeta {
        owner: owner.to_string(),
        name: name.to_string(),
        size,
        created_at_ms: 1_700_000_000_000,
        chunk_size: 100,
        shards,
    }
}

fn put_entry(term: u64, index: u64, op: &str, owner: &str, name: &str) -> LogEntry {
    LogEntry {
        term,
        index,
        op_id: op.to_string(),
        record: LogRecord::FilePut {
            file: file(owner, name, vec![shard(index, 0, &["n1:9001"])]),
        },
    }
}

// ============================================================
// SEGMENTS
// ============================================================

#[test]
fn segment_append_replay_roundtrip() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    {
        let mut log = LogStorage::open(state_dir.clone(), 0, 0).unwrap();
        for i in 1..=3 {
            log.append(put_entry(1, i, &format!("op-{i}"), "alice", &format!("f{i}")))
                .unwrap();
        }
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 1);
    }

    let log = LogStorage::open(state_dir, 0, 0).unwrap();
    assert_eq!(log.last_index(), 3);
    assert_eq!(log.entries().len(), 3);
    assert_eq!(log.entry_at(2).unwrap().op_id, "op-2");
    assert_eq!(log.term_at(0), Some(0));
    assert!(log.entry_at(4).is_none());
}

#[test]
fn segment_truncates_corrupt_tail() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    {
        let mut log = LogStorage::open(state_dir.clone(), 0, 0).unwrap();
        log.append(put_entry(1, 1, "op-1", "alice", "a")).unwrap();
        log.append(put_entry(1, 2, "op-2", "alice", "b")).unwrap();
    }

    // Flip a byte in the last record's checksum region.
    let segment = state_dir.join("segment-00000001.log");
    let mut bytes = std::fs::read(&segment).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&segment, &bytes).unwrap();

    let mut log = LogStorage::open(state_dir, 0, 0).unwrap();
    assert_eq!(log.last_index(), 1, "corrupt record must be dropped");

    // The log stays usable after the truncation.
    log.append(put_entry(2, 2, "op-2b", "alice", "c")).unwrap();
    assert_eq!(log.last_index(), 2);
    assert_eq!(log.entry_at(2).unwrap().op_id, "op-2b");
}

#[test]
fn segment_truncate_from_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    {
        let mut log = LogStorage::open(state_dir.clone(), 0, 0).unwrap();
        for i in 1..=3 {
            log.append(put_entry(1, i, &format!("op-{i}"), "alice", &format!("f{i}")))
                .unwrap();
        }
        log.truncate_from(2).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    let log = LogStorage::open(state_dir, 0, 0).unwrap();
    assert_eq!(log.last_index(), 1);
    assert_eq!(log.entry_at(1).unwrap().op_id, "op-1");
}

#[test]
fn hard_state_roundtrip() {
    let dir = TempDir::new().unwrap();
    assert_eq!(load_hard_state(dir.path()).unwrap().term, 0);

    let state = HardState {
        term: 7,
        voted_for: Some(node_id("n2:7002")),
        base_index: 0,
        base_term: 0,
        commit_index: 5,
    };
    save_hard_state(dir.path(), &state).unwrap();

    let loaded = load_hard_state(dir.path()).unwrap();
    assert_eq!(loaded.term, 7);
    assert_eq!(loaded.voted_for, Some(node_id("n2:7002")));
    assert_eq!(loaded.commit_index, 5);
}

// ============================================================
// MATERIALIZED VIEW
// ============================================================

#[test]
fn view_put_lookup_delete() {
    let mut view = ViewState::default();
    view.apply(&LogRecord::FilePut {
        file: file("alice", "report.pdf", vec![shard(1, 0, &["n1:9001", "n2:9002"])]),
    });

    assert!(view.file("alice", "report.pdf").is_some());
    assert!(view.file("bob", "report.pdf").is_none());
    assert_eq!(view.shard(ShardId(1)).unwrap().replicas.len(), 2);
    assert_eq!(view.max_shard_id(), 1);

    view.apply(&LogRecord::FileDelete {
        owner: "alice".into(),
        name: "report.pdf".into(),
    });
    assert!(view.file("alice", "report.pdf").is_none());
    assert!(view.shard(ShardId(1)).is_none());
}

#[test]
fn view_replace_drops_old_shards() {
    let mut view = ViewState::default();
    view.apply(&LogRecord::FilePut {
        file: file("alice", "notes", vec![shard(1, 0, &["n1:9001"])]),
    });
    view.apply(&LogRecord::FilePut {
        file: file("alice", "notes", vec![shard(2, 0, &["n2:9002"])]),
    });

    assert!(view.shard(ShardId(1)).is_none());
    assert!(view.shard(ShardId(2)).is_some());
    assert_eq!(view.file_count(), 1);
}

#[test]
fn view_replica_add_is_idempotent() {
    let mut view = ViewState::default();
    view.apply(&LogRecord::FilePut {
        file: file("alice", "notes", vec![shard(1, 0, &["n1:9001"])]),
    });

    let add = LogRecord::ShardReplicaAdd {
        shard: ShardId(1),
        node: node_id("n3:9003"),
    };
    view.apply(&add);
    view.apply(&add);
    assert_eq!(view.shard(ShardId(1)).unwrap().replicas.len(), 2);

    view.apply(&LogRecord::ShardReplicaRemove {
        shard: ShardId(1),
        node: node_id("n1:9001"),
    });
    let replicas = &view.shard(ShardId(1)).unwrap().replicas;
    assert_eq!(replicas.as_slice(), &[node_id("n3:9003")]);
}

#[test]
fn view_list_is_sorted_per_owner() {
    let mut view = ViewState::default();
    for name in ["zeta", "alpha", "mid"] {
        view.apply(&LogRecord::FilePut {
            file: file("alice", name, vec![]),
        });
    }
    view.apply(&LogRecord::FilePut {
        file: file("bob", "other", vec![]),
    });

    assert_eq!(view.list("alice"), vec!["alpha", "mid", "zeta"]);
    assert_eq!(view.list("bob"), vec!["other"]);
    assert!(view.list("carol").is_empty());
}

// ============================================================
// RAFT
// ============================================================

fn raft_fixture(dir: &TempDir, primary: bool) -> Arc<RaftNode> {
    let metrics = Arc::new(Metrics::new());
    RaftNode::new(
        node_id("n1:7001"),
        vec![],
        dir.path().join("state"),
        Arc::new(RpcClient::new(metrics.clone())),
        metrics,
        primary,
    )
    .unwrap()
}

#[tokio::test]
async fn submit_on_follower_reports_leader_changed() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    let err = raft
        .submit(
            "op-1".into(),
            LogRecord::FileDelete {
                owner: "alice".into(),
                name: "gone".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::LeaderChanged { .. }));
}

#[tokio::test]
async fn single_node_elects_commits_and_dedups() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, true);

    // Let the bootstrap election deadline pass, then tick.
    tokio::time::sleep(Duration::from_millis(250)).await;
    raft.tick().await;
    assert!(raft.is_leader());
    let info = raft.leader_info();
    assert!(info.is_leader);
    assert_eq!(info.leader.as_deref(), Some("n1:7001"));

    let record = LogRecord::FilePut {
        file: file("alice", "doc", vec![shard(1, 0, &["n1:9001"])]),
    };
    let index = raft.submit("op-1".into(), record.clone()).await.unwrap();
    assert_eq!(index, 1);
    assert!(raft.view_snapshot().file("alice", "doc").is_some());

    // Same idempotency key answers with the original index.
    let again = raft.submit("op-1".into(), record).await.unwrap();
    assert_eq!(again, 1);

    let next = raft
        .submit(
            "op-2".into(),
            LogRecord::ShardReplicaAdd {
                shard: ShardId(1),
                node: node_id("n2:9002"),
            },
        )
        .await
        .unwrap();
    assert_eq!(next, 2);
    assert_eq!(
        raft.view_snapshot().shard(ShardId(1)).unwrap().replicas.len(),
        2
    );
}

#[tokio::test]
async fn restart_recovers_committed_view() {
    let dir = TempDir::new().unwrap();
    {
        let raft = raft_fixture(&dir, true);
        tokio::time::sleep(Duration::from_millis(250)).await;
        raft.tick().await;
        raft.submit(
            "op-1".into(),
            LogRecord::FilePut {
                file: file("alice", "doc", vec![shard(1, 0, &["n1:9001"])]),
            },
        )
        .await
        .unwrap();
    }

    let reopened = raft_fixture(&dir, false);
    assert!(reopened.view_snapshot().file("alice", "doc").is_some());
    // Dedup map survives too: the same op resolves without leadership.
    let index = reopened
        .submit(
            "op-1".into(),
            LogRecord::FileDelete {
                owner: "x".into(),
                name: "y".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(index, 1);
}

#[tokio::test]
async fn follower_appends_and_applies_committed_prefix() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    let resp = raft.handle_append_entries(AppendEntriesRequest {
        term: 1,
        leader: node_id("n2:7002"),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![
            put_entry(1, 1, "op-1", "alice", "a"),
            put_entry(1, 2, "op-2", "alice", "b"),
        ],
        leader_commit: 1,
    });
    assert!(resp.success);
    assert_eq!(resp.last_index, 2);

    // Only the committed prefix is visible.
    let view = raft.view_snapshot();
    assert!(view.file("alice", "a").is_some());
    assert!(view.file("alice", "b").is_none());

    // Heartbeat advancing the commit applies the rest.
    let resp = raft.handle_append_entries(AppendEntriesRequest {
        term: 1,
        leader: node_id("n2:7002"),
        prev_log_index: 2,
        prev_log_term: 1,
        entries: vec![],
        leader_commit: 2,
    });
    assert!(resp.success);
    assert!(raft.view_snapshot().file("alice", "b").is_some());
}

#[tokio::test]
async fn follower_rejects_prev_log_mismatch() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    let resp = raft.handle_append_entries(AppendEntriesRequest {
        term: 1,
        leader: node_id("n2:7002"),
        prev_log_index: 5,
        prev_log_term: 1,
        entries: vec![put_entry(1, 6, "op-6", "alice", "f")],
        leader_commit: 0,
    });
    assert!(!resp.success);
    assert_eq!(resp.last_index, 0);
}

#[tokio::test]
async fn conflicting_suffix_is_truncated_to_leader_prefix() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    raft.handle_append_entries(AppendEntriesRequest {
        term: 1,
        leader: node_id("n2:7002"),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![
            put_entry(1, 1, "op-1", "alice", "a"),
            put_entry(1, 2, "op-2", "alice", "stale"),
        ],
        leader_commit: 1,
    });

    // A new leader overwrites the uncommitted suffix.
    let resp = raft.handle_append_entries(AppendEntriesRequest {
        term: 2,
        leader: node_id("n3:7003"),
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![put_entry(2, 2, "op-2b", "alice", "fresh")],
        leader_commit: 2,
    });
    assert!(resp.success);
    assert_eq!(resp.last_index, 2);

    let view = raft.view_snapshot();
    assert!(view.file("alice", "fresh").is_some());
    assert!(view.file("alice", "stale").is_none());
}

#[tokio::test]
async fn vote_granted_at_most_once_per_term() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    let first = raft.handle_request_vote(RequestVoteRequest {
        term: 5,
        candidate: node_id("n2:7002"),
        last_log_index: 0,
        last_log_term: 0,
    });
    assert!(first.granted);

    let rival = raft.handle_request_vote(RequestVoteRequest {
        term: 5,
        candidate: node_id("n3:7003"),
        last_log_index: 0,
        last_log_term: 0,
    });
    assert!(!rival.granted);

    // The same candidate may retry within the term.
    let retry = raft.handle_request_vote(RequestVoteRequest {
        term: 5,
        candidate: node_id("n2:7002"),
        last_log_index: 0,
        last_log_term: 0,
    });
    assert!(retry.granted);
}

#[tokio::test]
async fn vote_rejects_less_up_to_date_log() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    raft.handle_append_entries(AppendEntriesRequest {
        term: 2,
        leader: node_id("n2:7002"),
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![put_entry(2, 1, "op-1", "alice", "a")],
        leader_commit: 0,
    });

    let behind = raft.handle_request_vote(RequestVoteRequest {
        term: 3,
        candidate: node_id("n3:7003"),
        last_log_index: 5,
        last_log_term: 1,
    });
    assert!(!behind.granted, "older last term must lose");

    let current = raft.handle_request_vote(RequestVoteRequest {
        term: 3,
        candidate: node_id("n4:7004"),
        last_log_index: 1,
        last_log_term: 2,
    });
    assert!(current.granted);
}

#[tokio::test]
async fn install_snapshot_replaces_view_and_baseline() {
    let dir = TempDir::new().unwrap();
    let raft = raft_fixture(&dir, false);

    let resp = raft.handle_install_snapshot(InstallSnapshotRequest {
        term: 4,
        leader: node_id("n2:7002"),
        last_included_index: 10,
        last_included_term: 3,
        files: vec![file("alice", "snap", vec![shard(9, 0, &["n1:9001"])])],
    });
    assert_eq!(resp.term, 4);

    let view = raft.view_snapshot();
    assert!(view.file("alice", "snap").is_some());
    assert_eq!(view.max_shard_id(), 9);

    // Appends continue from the snapshot baseline.
    let append = raft.handle_append_entries(AppendEntriesRequest {
        term: 4,
        leader: node_id("n2:7002"),
        prev_log_index: 10,
        prev_log_term: 3,
        entries: vec![put_entry(4, 11, "op-11", "alice", "after")],
        leader_commit: 11,
    });
    assert!(append.success);
    assert!(raft.view_snapshot().file("alice", "after").is_some());
}
