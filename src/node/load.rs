//! Node load sampling.
//!
//! Produces the load vector heartbeats report: instantaneous CPU utilization
//! from `sysinfo` plus the shard store's disk counters.

use std::path::Path;
use std::sync::Mutex;

use sysinfo::{Disks, System};

use crate::membership::types::LoadVector;
use crate::node::store::ShardStore;

pub struct LoadSampler {
    sys: Mutex<System>,
}

impl LoadSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new_all()),
        }
    }

    /// CPU utilization in [0, 1].
    pub fn cpu(&self) -> f32 {
        let mut sys = self.sys.lock().expect("sampler lock poisoned");
        sys.refresh_cpu();
        (sys.global_cpu_info().cpu_usage() / 100.0).clamp(0.0, 1.0)
    }

    pub fn sample(&self, store: &ShardStore) -> LoadVector {
        LoadVector {
            cpu: self.cpu(),
            disk_used: store.used_bytes(),
            disk_capacity: store.capacity_bytes(),
            shard_count: store.shard_count(),
        }
    }
}

impl Default for LoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Total size of the disk holding `path`, used as the store's byte budget.
/// Falls back to zero (no budget enforcement) if the mount cannot be found.
pub fn detect_disk_capacity(path: &Path) -> u64 {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if resolved.starts_with(mount) {
            let depth = mount.components().count();
            if best.map(|(d, _)| depth > d).unwrap_or(true) {
                best = Some((depth, disk.total_space()));
            }
        }
    }
    best.map(|(_, space)| space).unwrap_or(0)
}
