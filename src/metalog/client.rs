//! Coordinator-side client for the replicated metadata log.
//!
//! Tracks the current leader hint and retries submissions transparently when
//! the leader moves: the same idempotency key is replayed against the new
//! leader, so a `LeaderChanged` mid-append never duplicates a record. View
//! reads go to any replica unless the caller asks for the leader.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use super::protocol::{
    FileResponse, LeaderResponse, ListResponse, MaxShardResponse, ShardsResponse, SubmitRequest,
    SubmitResponse, ENDPOINT_LEADER, ENDPOINT_SUBMIT, ENDPOINT_VIEW_FILE, ENDPOINT_VIEW_LIST,
    ENDPOINT_VIEW_MAX_SHARD, ENDPOINT_VIEW_SHARDS,
};
use super::types::{FileMeta, LogRecord, ShardMeta};
use crate::error::{ClusterError, Result};
use crate::rpc::RpcClient;

const META_RPC_DEADLINE: Duration = Duration::from_secs(3);
const SUBMIT_ROUNDS: usize = 4;
const SUBMIT_BACKOFF: Duration = Duration::from_millis(250);

pub struct MetaClient {
    rpc: Arc<RpcClient>,
    raft_addrs: Vec<String>,
    leader_hint: RwLock<Option<String>>,
}

impl MetaClient {
    pub fn new(rpc: Arc<RpcClient>, raft_addrs: Vec<String>, bootstrap: Option<String>) -> Self {
        Self {
            rpc,
            raft_addrs,
            leader_hint: RwLock::new(bootstrap),
        }
    }

    fn hint(&self) -> Option<String> {
        self.leader_hint.read().expect("hint lock poisoned").clone()
    }

    fn set_hint(&self, hint: Option<String>) {
        *self.leader_hint.write().expect("hint lock poisoned") = hint;
    }

    /// Hint first, then the rest of the quorum set.
    fn targets(&self) -> Vec<String> {
        let mut ordered = Vec::with_capacity(self.raft_addrs.len());
        if let Some(hint) = self.hint() {
            ordered.push(hint);
        }
        for addr in &self.raft_addrs {
            if !ordered.contains(addr) {
                ordered.push(addr.clone());
            }
        }
        ordered
    }

    /// Append a record through the current leader, committing before return.
    pub async fn submit(&self, op_id: &str, record: &LogRecord) -> Result<u64> {
        let request = SubmitRequest {
            op_id: op_id.to_string(),
            record: record.clone(),
        };
        let mut last_err = ClusterError::LeaderChanged { hint: None };

        for round in 0..SUBMIT_ROUNDS {
            for target in self.targets() {
                let url = format!("http://{target}{ENDPOINT_SUBMIT}");
                let response = match self.rpc.post_json(url, &request, META_RPC_DEADLINE, 1).await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        last_err = e;
                        continue;
                    }
                };

                if response.status().is_success() {
                    match response.json::<SubmitResponse>().await {
                        Ok(reply) if reply.committed => {
                            self.set_hint(Some(target));
                            return Ok(reply.index.unwrap_or_default());
                        }
                        Ok(_) | Err(_) => {
                            last_err =
                                ClusterError::Rpc("submit: malformed commit reply".into());
                            continue;
                        }
                    }
                }

                if response.status() == reqwest::StatusCode::MISDIRECTED_REQUEST {
                    let hint = response
                        .json::<SubmitResponse>()
                        .await
                        .ok()
                        .and_then(|r| r.leader_hint);
                    debug!("Submit redirected, new leader hint: {:?}", hint);
                    last_err = ClusterError::LeaderChanged { hint: hint.clone() };
                    self.set_hint(hint);
                    continue;
                }

                last_err = ClusterError::Rpc(format!("submit to {target}: {}", response.status()));
            }
            if round + 1 < SUBMIT_ROUNDS {
                tokio::time::sleep(SUBMIT_BACKOFF * (round as u32 + 1)).await;
            }
        }
        Err(last_err)
    }

    /// Resolve the current leader's raft address, refreshing the hint.
    pub async fn leader(&self) -> Option<String> {
        for target in self.targets() {
            let url = format!("http://{target}{ENDPOINT_LEADER}");
            if let Ok(resp) = self.rpc.get(url, META_RPC_DEADLINE, 1).await {
                if let Ok(info) = resp.json::<LeaderResponse>().await {
                    if info.is_leader {
                        self.set_hint(Some(target.clone()));
                        return Some(target);
                    }
                    if let Some(leader) = info.leader {
                        self.set_hint(Some(leader.clone()));
                        return Some(leader);
                    }
                }
            }
        }
        None
    }

    async fn read_targets(&self, prefer_leader: bool) -> Vec<String> {
        if prefer_leader {
            self.leader().await;
        }
        self.targets()
    }

    pub async fn fetch_file(
        &self,
        owner: &str,
        name: &str,
        prefer_leader: bool,
    ) -> Result<Option<FileMeta>> {
        let mut last_err = ClusterError::Rpc("metadata view unreachable".into());
        for target in self.read_targets(prefer_leader).await {
            let url = format!("http://{target}{ENDPOINT_VIEW_FILE}/{owner}/{name}");
            match self.rpc.get(url, META_RPC_DEADLINE, 1).await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(reply) = resp.json::<FileResponse>().await {
                        return Ok(reply.file);
                    }
                }
                Ok(resp) => last_err = ClusterError::Rpc(format!("view read: {}", resp.status())),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub async fn list_files(&self, owner: &str) -> Result<Vec<String>> {
        let mut last_err = ClusterError::Rpc("metadata view unreachable".into());
        for target in self.read_targets(false).await {
            let url = format!("http://{target}{ENDPOINT_VIEW_LIST}/{owner}");
            match self.rpc.get(url, META_RPC_DEADLINE, 1).await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(reply) = resp.json::<ListResponse>().await {
                        return Ok(reply.files);
                    }
                }
                Ok(resp) => last_err = ClusterError::Rpc(format!("view list: {}", resp.status())),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Every shard the committed log knows about. Leader read: this feeds
    /// mutating repair decisions.
    pub async fn all_shards(&self) -> Result<Vec<ShardMeta>> {
        let mut last_err = ClusterError::Rpc("metadata view unreachable".into());
        for target in self.read_targets(true).await {
            let url = format!("http://{target}{ENDPOINT_VIEW_SHARDS}");
            match self.rpc.get(url, META_RPC_DEADLINE, 1).await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(reply) = resp.json::<ShardsResponse>().await {
                        return Ok(reply.shards);
                    }
                }
                Ok(resp) => last_err = ClusterError::Rpc(format!("view shards: {}", resp.status())),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    pub async fn max_shard_id(&self) -> Result<u64> {
        let mut last_err = ClusterError::Rpc("metadata view unreachable".into());
        for target in self.read_targets(true).await {
            let url = format!("http://{target}{ENDPOINT_VIEW_MAX_SHARD}");
            match self.rpc.get(url, META_RPC_DEADLINE, 1).await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(reply) = resp.json::<MaxShardResponse>().await {
                        return Ok(reply.max_shard_id);
                    }
                }
                Ok(resp) => {
                    last_err = ClusterError::Rpc(format!("view max shard: {}", resp.status()))
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}
