//! On-disk shard store.
//!
//! One file per shard, named by the decimal shard id, inside the node's data
//! directory. Writes land in a temp file, are fsynced, then renamed into
//! place, so readers never observe a partial shard and a crash leaves at
//! worst a stale `.tmp` that the next open sweeps away.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{ClusterError, Result};
use crate::metalog::types::ShardId;

pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct ShardStore {
    dir: PathBuf,
    used_bytes: AtomicU64,
    shard_count: AtomicU64,
    capacity_bytes: u64,
    high_water: f64,
}

impl ShardStore {
    /// Open (or create) the store, sweeping stale temp files and rebuilding
    /// the usage counters from what is on disk.
    pub fn open(dir: PathBuf, capacity_bytes: u64, high_water: f64) -> Result<Self> {
        fs::create_dir_all(&dir)?;

        let mut used = 0u64;
        let mut count = 0u64;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            if entry.file_type()?.is_file() {
                used += entry.metadata()?.len();
                count += 1;
            }
        }

        Ok(Self {
            dir,
            used_bytes: AtomicU64::new(used),
            shard_count: AtomicU64::new(count),
            capacity_bytes,
            high_water,
        })
    }

    fn shard_path(&self, id: ShardId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    pub fn contains(&self, id: ShardId) -> bool {
        self.shard_path(id).exists()
    }

    pub fn shard_count(&self) -> u64 {
        self.shard_count.load(Ordering::SeqCst)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Write a shard durably. Verifies the content digest first and enforces
    /// the disk high-water mark.
    pub fn write(&self, id: ShardId, bytes: &[u8], expected_digest: &str) -> Result<()> {
        let computed = digest_hex(bytes);
        if !computed.eq_ignore_ascii_case(expected_digest) {
            return Err(ClusterError::DigestMismatch {
                shard: id.0,
                expected: expected_digest.to_string(),
                computed,
            });
        }

        let dest = self.shard_path(id);
        let prev_len = fs::metadata(&dest).map(|m| m.len()).ok();
        let projected =
            self.used_bytes.load(Ordering::SeqCst) - prev_len.unwrap_or(0) + bytes.len() as u64;
        if self.capacity_bytes > 0 {
            let limit = (self.capacity_bytes as f64 * self.high_water) as u64;
            if projected > limit {
                return Err(ClusterError::OutOfSpace {
                    used: projected,
                    limit,
                });
            }
        }

        let tmp = self.dir.join(format!("{id}.tmp"));
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &dest)?;
        sync_dir(&self.dir);

        if prev_len.is_none() {
            self.shard_count.fetch_add(1, Ordering::SeqCst);
        }
        self.used_bytes.store(projected, Ordering::SeqCst);
        Ok(())
    }

    pub fn read(&self, id: ShardId) -> Result<Bytes> {
        match fs::read(self.shard_path(id)) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ClusterError::NotFound(format!("shard {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn digest(&self, id: ShardId) -> Result<String> {
        self.read(id).map(|bytes| digest_hex(&bytes))
    }

    /// Remove a shard. Missing is success (delete is idempotent); returns
    /// whether a file was actually removed.
    pub fn delete(&self, id: ShardId) -> Result<bool> {
        let path = self.shard_path(id);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                self.used_bytes.fetch_sub(len, Ordering::SeqCst);
                self.shard_count.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
