//! Leader-based replication of the metadata log.
//!
//! Classical randomized elections with term numbers: followers grant at most
//! one vote per term and only to candidates whose log is at least as
//! up-to-date. The leader appends locally, replicates to followers, and
//! commits once a majority has persisted the entry; committed entries are
//! applied to the materialized view and never overwritten. Followers answer
//! client submissions with a leader hint so the coordinator can retry
//! transparently with the same idempotency key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};

use super::protocol::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    LeaderResponse, RequestVoteRequest, RequestVoteResponse, ENDPOINT_APPEND_ENTRIES,
    ENDPOINT_INSTALL_SNAPSHOT, ENDPOINT_REQUEST_VOTE,
};
use super::segment::{load_hard_state, save_hard_state, HardState, LogStorage};
use super::types::{LogEntry, LogRecord};
use super::view::{MaterializedView, ViewState};
use crate::error::{ClusterError, Result};
use crate::membership::types::NodeId;
use crate::metrics::Metrics;
use crate::rpc::RpcClient;

pub const TICK_INTERVAL: Duration = Duration::from_millis(50);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const ELECTION_TIMEOUT_MIN_MS: u64 = 300;
const ELECTION_TIMEOUT_MAX_MS: u64 = 600;
/// Bootstrap-primary nodes race ahead of the pack on the first election.
const PRIMARY_BOOTSTRAP_DELAY: Duration = Duration::from_millis(150);
const RAFT_RPC_DEADLINE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

struct RaftState {
    role: Role,
    term: u64,
    voted_for: Option<NodeId>,
    commit_index: u64,
    last_applied: u64,
    leader_hint: Option<NodeId>,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
}

enum TickAction {
    Broadcast,
    Election {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
}

enum Outbound {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    dir: PathBuf,
    state: Mutex<RaftState>,
    log: Mutex<LogStorage>,
    view: Arc<MaterializedView>,
    rpc: Arc<RpcClient>,
    metrics: Arc<Metrics>,
    /// op_id -> committed index; duplicate submissions are answered from here.
    committed_ops: DashMap<String, u64>,
}

impl RaftNode {
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        dir: PathBuf,
        rpc: Arc<RpcClient>,
        metrics: Arc<Metrics>,
        bootstrap_primary: bool,
    ) -> Result<Arc<Self>> {
        let hard = load_hard_state(&dir)?;
        let log = LogStorage::open(dir.clone(), hard.base_index, hard.base_term)?;

        let commit_index = hard.commit_index.min(log.last_index());
        let view = Arc::new(MaterializedView::new());
        let committed_ops = DashMap::new();
        let mut records = Vec::new();
        for entry in log.entries() {
            if entry.index > commit_index {
                break;
            }
            committed_ops.insert(entry.op_id.clone(), entry.index);
            records.push(entry.record.clone());
        }
        view.apply(records);

        let first_deadline = if bootstrap_primary {
            Instant::now() + PRIMARY_BOOTSTRAP_DELAY
        } else {
            Instant::now() + random_timeout()
        };

        let node = Arc::new(Self {
            id,
            peers,
            dir,
            state: Mutex::new(RaftState {
                role: Role::Follower,
                term: hard.term,
                voted_for: hard.voted_for,
                commit_index,
                last_applied: commit_index,
                leader_hint: None,
                election_deadline: first_deadline,
                last_heartbeat_sent: Instant::now(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
            }),
            log: Mutex::new(log),
            view,
            rpc,
            metrics,
            committed_ops,
        });
        info!(
            "Metadata log open: {} entries, committed through {}",
            node.log.lock().expect("log lock poisoned").entries().len(),
            commit_index
        );
        Ok(node)
    }

    pub fn view_snapshot(&self) -> Arc<ViewState> {
        self.view.snapshot()
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().expect("raft lock poisoned").role == Role::Leader
    }

    pub fn leader_info(&self) -> LeaderResponse {
        let state = self.state.lock().expect("raft lock poisoned");
        LeaderResponse {
            leader: state.leader_hint.as_ref().map(|n| n.0.clone()),
            term: state.term,
            is_leader: state.role == Role::Leader,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Raft participant {} started ({} peers)", self.id, self.peers.len());
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        let action = {
            let mut state = self.state.lock().expect("raft lock poisoned");
            let now = Instant::now();
            match state.role {
                Role::Leader => {
                    if now >= state.last_heartbeat_sent + HEARTBEAT_INTERVAL {
                        state.last_heartbeat_sent = now;
                        Some(TickAction::Broadcast)
                    } else {
                        None
                    }
                }
                Role::Follower | Role::Candidate => {
                    if now >= state.election_deadline {
                        state.role = Role::Candidate;
                        state.term += 1;
                        state.voted_for = Some(self.id.clone());
                        state.election_deadline = now + random_timeout();
                        let log = self.log.lock().expect("log lock poisoned");
                        self.persist(&state, &log);
                        Some(TickAction::Election {
                            term: state.term,
                            last_log_index: log.last_index(),
                            last_log_term: log.last_term(),
                        })
                    } else {
                        None
                    }
                }
            }
        };

        match action {
            Some(TickAction::Broadcast) => self.broadcast_append().await,
            Some(TickAction::Election {
                term,
                last_log_index,
                last_log_term,
            }) => self.run_election(term, last_log_index, last_log_term).await,
            None => {}
        }
    }

    async fn run_election(&self, term: u64, last_log_index: u64, last_log_term: u64) {
        self.metrics.elections.inc();
        info!("Starting election for term {}", term);

        let request = RequestVoteRequest {
            term,
            candidate: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        let votes = futures::future::join_all(self.peers.iter().map(|peer| {
            let request = request.clone();
            let url = format!("http://{}{}", peer, ENDPOINT_REQUEST_VOTE);
            async move {
                match self.rpc.post_json(url, &request, RAFT_RPC_DEADLINE, 1).await {
                    Ok(resp) if resp.status().is_success() => {
                        resp.json::<RequestVoteResponse>().await.ok()
                    }
                    _ => None,
                }
            }
        }))
        .await;

        let mut granted = 1usize;
        let mut observed_term = term;
        for vote in votes.into_iter().flatten() {
            if vote.granted {
                granted += 1;
            }
            observed_term = observed_term.max(vote.term);
        }

        let won = {
            let mut state = self.state.lock().expect("raft lock poisoned");
            if observed_term > state.term {
                let log = self.log.lock().expect("log lock poisoned");
                self.step_down(&mut state, &log, observed_term);
                false
            } else if state.term != term || state.role != Role::Candidate {
                false
            } else if granted * 2 > self.peers.len() + 1 {
                state.role = Role::Leader;
                state.leader_hint = Some(self.id.clone());
                state.last_heartbeat_sent = Instant::now();
                let log = self.log.lock().expect("log lock poisoned");
                let next = log.last_index() + 1;
                for peer in &self.peers {
                    state.next_index.insert(peer.clone(), next);
                    state.match_index.insert(peer.clone(), 0);
                }
                self.advance_commit(&mut state, &log);
                self.metrics.leader_changes.inc();
                info!("Won election: leader for term {} ({} votes)", term, granted);
                true
            } else {
                debug!("Election for term {} lost ({} votes)", term, granted);
                false
            }
        };

        if won {
            self.broadcast_append().await;
        }
    }

    async fn broadcast_append(&self) {
        futures::future::join_all(self.peers.iter().map(|peer| self.append_to_peer(peer))).await;
    }

    async fn append_to_peer(&self, peer: &NodeId) {
        let outbound = {
            let state = self.state.lock().expect("raft lock poisoned");
            if state.role != Role::Leader {
                return;
            }
            let log = self.log.lock().expect("log lock poisoned");
            let next = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(log.last_index() + 1);

            if next <= log.base_index() {
                // The follower needs entries we no longer hold.
                Outbound::Snapshot(InstallSnapshotRequest {
                    term: state.term,
                    leader: self.id.clone(),
                    last_included_index: state.last_applied,
                    last_included_term: log
                        .term_at(state.last_applied)
                        .unwrap_or(log.base_term()),
                    files: self.view.snapshot().all_files(),
                })
            } else {
                let prev_log_index = next - 1;
                Outbound::Append(AppendEntriesRequest {
                    term: state.term,
                    leader: self.id.clone(),
                    prev_log_index,
                    prev_log_term: log.term_at(prev_log_index).unwrap_or(0),
                    entries: log.entries_from(next),
                    leader_commit: state.commit_index,
                })
            }
        };

        match outbound {
            Outbound::Append(request) => self.send_append(peer, request).await,
            Outbound::Snapshot(request) => self.send_snapshot(peer, request).await,
        }
    }

    async fn send_append(&self, peer: &NodeId, request: AppendEntriesRequest) {
        let url = format!("http://{}{}", peer, ENDPOINT_APPEND_ENTRIES);
        let response = match self.rpc.post_json(url, &request, RAFT_RPC_DEADLINE, 1).await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<AppendEntriesResponse>().await.ok()
            }
            _ => None,
        };
        let Some(reply) = response else {
            debug!("AppendEntries to {} got no reply", peer);
            return;
        };

        let mut state = self.state.lock().expect("raft lock poisoned");
        let log = self.log.lock().expect("log lock poisoned");
        if reply.term > state.term {
            self.step_down(&mut state, &log, reply.term);
            return;
        }
        if state.role != Role::Leader || state.term != request.term {
            return;
        }

        if reply.success {
            let matched = request.prev_log_index + request.entries.len() as u64;
            state.match_index.insert(peer.clone(), matched);
            state.next_index.insert(peer.clone(), matched + 1);
            self.advance_commit(&mut state, &log);
        } else {
            let current = state
                .next_index
                .get(peer)
                .copied()
                .unwrap_or(log.last_index() + 1);
            let backed_off = current.saturating_sub(1).min(reply.last_index + 1).max(1);
            state.next_index.insert(peer.clone(), backed_off);
        }
    }

    async fn send_snapshot(&self, peer: &NodeId, request: InstallSnapshotRequest) {
        let url = format!("http://{}{}", peer, ENDPOINT_INSTALL_SNAPSHOT);
        let response = match self.rpc.post_json(url, &request, RAFT_RPC_DEADLINE, 1).await {
            Ok(resp) if resp.status().is_success() => {
                resp.json::<InstallSnapshotResponse>().await.ok()
            }
            _ => None,
        };
        let Some(reply) = response else {
            return;
        };

        let mut state = self.state.lock().expect("raft lock poisoned");
        let log = self.log.lock().expect("log lock poisoned");
        if reply.term > state.term {
            self.step_down(&mut state, &log, reply.term);
            return;
        }
        state
            .match_index
            .insert(peer.clone(), request.last_included_index);
        state
            .next_index
            .insert(peer.clone(), request.last_included_index + 1);
    }

    /// Append a record as leader and wait for majority commit. Duplicate
    /// op_ids return the original committed index without re-appending.
    pub async fn submit(&self, op_id: String, record: LogRecord) -> Result<u64> {
        if let Some(existing) = self.committed_ops.get(&op_id) {
            return Ok(*existing);
        }

        let index = {
            let state = self.state.lock().expect("raft lock poisoned");
            if state.role != Role::Leader {
                return Err(ClusterError::LeaderChanged {
                    hint: state.leader_hint.as_ref().map(|n| n.0.clone()),
                });
            }
            let mut log = self.log.lock().expect("log lock poisoned");
            let index = log.last_index() + 1;
            log.append(LogEntry {
                term: state.term,
                index,
                op_id: op_id.clone(),
                record,
            })?;
            self.metrics.log_appends.inc();
            index
        };

        // Two replication rounds: the first ships the entry, the second
        // gives stragglers a chance before the submit is failed.
        for _ in 0..2 {
            self.broadcast_append().await;
            let mut state = self.state.lock().expect("raft lock poisoned");
            let log = self.log.lock().expect("log lock poisoned");
            self.advance_commit(&mut state, &log);
            if state.commit_index >= index {
                return Ok(index);
            }
        }

        Err(ClusterError::Rpc(format!(
            "append of {op_id} not committed: no quorum"
        )))
    }

    pub fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().expect("raft lock poisoned");
        let mut log = self.log.lock().expect("log lock poisoned");

        if req.term < state.term {
            return AppendEntriesResponse {
                term: state.term,
                success: false,
                last_index: log.last_index(),
            };
        }

        let term_changed = req.term > state.term;
        if term_changed {
            state.term = req.term;
            state.voted_for = None;
        }
        if state.role == Role::Leader {
            warn!("Stepping down: {} leads term {}", req.leader, req.term);
            self.metrics.leader_changes.inc();
        }
        state.role = Role::Follower;
        state.leader_hint = Some(req.leader.clone());
        state.election_deadline = Instant::now() + random_timeout();
        if term_changed {
            self.persist(&state, &log);
        }

        // Log consistency check on the entry before the new batch.
        if req.prev_log_index > 0 && log.term_at(req.prev_log_index) != Some(req.prev_log_term) {
            return AppendEntriesResponse {
                term: state.term,
                success: false,
                last_index: log.last_index(),
            };
        }

        for entry in &req.entries {
            match log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    // Conflict: drop our divergent suffix, keep the leader's.
                    if log.truncate_from(entry.index).is_err()
                        || log.append(entry.clone()).is_err()
                    {
                        return AppendEntriesResponse {
                            term: state.term,
                            success: false,
                            last_index: log.last_index(),
                        };
                    }
                }
                None => {
                    if entry.index != log.last_index() + 1 || log.append(entry.clone()).is_err() {
                        return AppendEntriesResponse {
                            term: state.term,
                            success: false,
                            last_index: log.last_index(),
                        };
                    }
                }
            }
        }

        if req.leader_commit > state.commit_index {
            state.commit_index = req.leader_commit.min(log.last_index());
            self.apply_committed(&mut state, &log);
            self.persist(&state, &log);
        }

        AppendEntriesResponse {
            term: state.term,
            success: true,
            last_index: log.last_index(),
        }
    }

    pub fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock().expect("raft lock poisoned");
        let log = self.log.lock().expect("log lock poisoned");

        if req.term < state.term {
            return RequestVoteResponse {
                term: state.term,
                granted: false,
            };
        }
        if req.term > state.term {
            state.term = req.term;
            state.voted_for = None;
            state.role = Role::Follower;
        }

        let up_to_date = (req.last_log_term, req.last_log_index)
            >= (log.last_term(), log.last_index());
        let may_vote = state
            .voted_for
            .as_ref()
            .map(|v| v == &req.candidate)
            .unwrap_or(true);

        let granted = up_to_date && may_vote;
        if granted {
            state.voted_for = Some(req.candidate.clone());
            state.election_deadline = Instant::now() + random_timeout();
        }
        self.persist(&state, &log);

        RequestVoteResponse {
            term: state.term,
            granted,
        }
    }

    pub fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.lock().expect("raft lock poisoned");
        let mut log = self.log.lock().expect("log lock poisoned");

        if req.term < state.term {
            return InstallSnapshotResponse { term: state.term };
        }

        state.term = req.term;
        state.role = Role::Follower;
        state.leader_hint = Some(req.leader.clone());
        state.election_deadline = Instant::now() + random_timeout();

        if log
            .install_base(req.last_included_index, req.last_included_term)
            .is_ok()
        {
            state.commit_index = req.last_included_index;
            state.last_applied = req.last_included_index;
            self.view.replace(ViewState::from_files(req.files));
        }
        self.persist(&state, &log);

        InstallSnapshotResponse { term: state.term }
    }

    fn step_down(&self, state: &mut MutexGuard<'_, RaftState>, log: &LogStorage, term: u64) {
        if state.role == Role::Leader {
            warn!("Stepping down: observed higher term {}", term);
            self.metrics.leader_changes.inc();
        }
        state.term = term;
        state.role = Role::Follower;
        state.voted_for = None;
        state.election_deadline = Instant::now() + random_timeout();
        self.persist(state, log);
    }

    /// Leader-side commit rule: the highest index persisted on a majority,
    /// provided it belongs to the current term.
    fn advance_commit(&self, state: &mut MutexGuard<'_, RaftState>, log: &LogStorage) {
        if state.role != Role::Leader {
            return;
        }
        let mut matches: Vec<u64> = self
            .peers
            .iter()
            .map(|p| state.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matches.push(log.last_index());
        matches.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matches[(self.peers.len() + 1) / 2];
        if candidate > state.commit_index && log.term_at(candidate) == Some(state.term) {
            state.commit_index = candidate;
            self.apply_committed(state, log);
            self.persist(state, log);
        }
    }

    fn apply_committed(&self, state: &mut MutexGuard<'_, RaftState>, log: &LogStorage) {
        if state.commit_index <= state.last_applied {
            return;
        }
        let mut records = Vec::new();
        for index in state.last_applied + 1..=state.commit_index {
            if let Some(entry) = log.entry_at(index) {
                self.committed_ops.insert(entry.op_id.clone(), entry.index);
                records.push(entry.record.clone());
            }
        }
        state.last_applied = state.commit_index;
        self.view.apply(records);
    }

    fn persist(&self, state: &RaftState, log: &LogStorage) {
        let hard = HardState {
            term: state.term,
            voted_for: state.voted_for.clone(),
            base_index: log.base_index(),
            base_term: log.base_term(),
            commit_index: state.commit_index,
        };
        if let Err(e) = save_hard_state(&self.dir, &hard) {
            warn!("Failed to persist raft state: {}", e);
        }
    }
}

fn random_timeout() -> Duration {
    let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..ELECTION_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}
