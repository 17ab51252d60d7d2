//! Non-blocking cache writeback.
//!
//! Admitting a chunk to the cache on a read miss must not stall the reader on
//! disk I/O, so cache-line spills ride an unbounded FIFO queue drained by a
//! single background worker. Only derived state travels this path:
//! acknowledged durable writes always use the synchronous store. Past a
//! configured depth, new admissions bypass the cache entirely until the queue
//! drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::metalog::types::ShardId;
use crate::metrics::Metrics;

struct Job {
    shard: ShardId,
    bytes: Bytes,
}

pub struct WritebackQueue {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    high_water: usize,
    spill_dir: PathBuf,
}

impl WritebackQueue {
    /// Spawn the drain worker. Spilled cache lines live under `spill_dir`,
    /// one file per shard id.
    pub fn start(
        spill_dir: PathBuf,
        high_water: usize,
        metrics: Arc<Metrics>,
    ) -> std::io::Result<(Self, JoinHandle<()>)> {
        std::fs::create_dir_all(&spill_dir)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));

        let worker_depth = depth.clone();
        let worker_dir = spill_dir.clone();
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let dir = worker_dir.clone();
                let result =
                    tokio::task::spawn_blocking(move || write_spill(&dir, job.shard, &job.bytes))
                        .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Writeback spill for shard {} failed: {}", job.shard, e),
                    Err(e) => warn!("Writeback worker join error: {}", e),
                }
                let remaining = worker_depth.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics.writeback_depth.set(remaining as u64);
            }
        });

        Ok((
            Self {
                tx,
                depth,
                high_water,
                spill_dir,
            },
            handle,
        ))
    }

    /// True when the queue is past its high-water mark; callers then serve
    /// read misses straight from disk without caching.
    pub fn should_bypass(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > self.high_water
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn enqueue(&self, shard: ShardId, bytes: Bytes) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Job { shard, bytes }).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Drop the spilled line for a shard, if any. Used on delete and after
    /// eviction so the spill directory tracks cache residency.
    pub fn remove_spill(&self, shard: ShardId) {
        let path = self.spill_dir.join(shard.to_string());
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove spill {}: {}", path.display(), e);
            }
        }
    }

    pub fn spill_path(&self, shard: ShardId) -> PathBuf {
        self.spill_dir.join(shard.to_string())
    }
}

fn write_spill(dir: &Path, shard: ShardId, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp = dir.join(format!("{shard}.tmp"));
    let dest = dir.join(shard.to_string());

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp, &dest)?;
    Ok(())
}
