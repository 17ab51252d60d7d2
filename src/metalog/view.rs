//! Materialized view of the committed log.
//!
//! Only the log-apply path mutates the view; every reader takes a cheap
//! `Arc` snapshot, so placement and status reads never block behind an
//! apply. Replacement is copy-on-write: apply clones the state, folds the
//! new records in, and swaps the pointer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::types::{FileMeta, LogRecord, ShardId, ShardMeta};

#[derive(Debug, Clone, Default)]
pub struct ViewState {
    files: HashMap<(String, String), FileMeta>,
    /// Shard id -> owning file key.
    shard_index: HashMap<ShardId, (String, String)>,
}

impl ViewState {
    pub fn from_files(files: Vec<FileMeta>) -> Self {
        let mut state = Self::default();
        for file in files {
            state.apply(&LogRecord::FilePut { file });
        }
        state
    }

    pub fn apply(&mut self, record: &LogRecord) {
        match record {
            LogRecord::FilePut { file } => {
                let key = (file.owner.clone(), file.name.clone());
                if let Some(previous) = self.files.remove(&key) {
                    for shard in &previous.shards {
                        self.shard_index.remove(&shard.id);
                    }
                }
                for shard in &file.shards {
                    self.shard_index.insert(shard.id, key.clone());
                }
                self.files.insert(key, file.clone());
            }
            LogRecord::FileDelete { owner, name } => {
                let key = (owner.clone(), name.clone());
                if let Some(file) = self.files.remove(&key) {
                    for shard in &file.shards {
                        self.shard_index.remove(&shard.id);
                    }
                }
            }
            LogRecord::ShardReplicaAdd { shard, node } => {
                if let Some(meta) = self.shard_mut(*shard) {
                    if !meta.replicas.contains(node) {
                        meta.replicas.push(node.clone());
                    }
                }
            }
            LogRecord::ShardReplicaRemove { shard, node } => {
                if let Some(meta) = self.shard_mut(*shard) {
                    meta.replicas.retain(|n| n != node);
                }
            }
        }
    }

    fn shard_mut(&mut self, id: ShardId) -> Option<&mut ShardMeta> {
        let key = self.shard_index.get(&id)?.clone();
        self.files
            .get_mut(&key)?
            .shards
            .iter_mut()
            .find(|s| s.id == id)
    }

    pub fn file(&self, owner: &str, name: &str) -> Option<&FileMeta> {
        self.files.get(&(owner.to_string(), name.to_string()))
    }

    pub fn list(&self, owner: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter(|(file_owner, _)| file_owner == owner)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn shard(&self, id: ShardId) -> Option<&ShardMeta> {
        let key = self.shard_index.get(&id)?;
        self.files.get(key)?.shards.iter().find(|s| s.id == id)
    }

    pub fn all_shards(&self) -> Vec<ShardMeta> {
        self.files
            .values()
            .flat_map(|f| f.shards.iter().cloned())
            .collect()
    }

    pub fn all_files(&self) -> Vec<FileMeta> {
        self.files.values().cloned().collect()
    }

    pub fn max_shard_id(&self) -> u64 {
        self.shard_index.keys().map(|id| id.0).max().unwrap_or(0)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

pub struct MaterializedView {
    current: RwLock<Arc<ViewState>>,
}

impl MaterializedView {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(ViewState::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<ViewState> {
        self.current.read().expect("view lock poisoned").clone()
    }

    pub fn apply(&self, records: impl IntoIterator<Item = LogRecord>) {
        let mut next = {
            let guard = self.current.read().expect("view lock poisoned");
            ViewState::clone(&guard)
        };
        for record in records {
            next.apply(&record);
        }
        *self.current.write().expect("view lock poisoned") = Arc::new(next);
    }

    pub fn replace(&self, state: ViewState) {
        *self.current.write().expect("view lock poisoned") = Arc::new(state);
    }
}

impl Default for MaterializedView {
    fn default() -> Self {
        Self::new()
    }
}
