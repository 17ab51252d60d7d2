//! Hybrid LRU + LFU Cache
//!
//! Per-node in-memory chunk cache with score-based eviction. Each entry is
//! scored on two axes: how often it is hit (log-normalized against the
//! maximum observed frequency) and how recently (piecewise decay: flat for
//! five minutes, linear to 0.7 at thirty minutes, exponential after that).
//! The eviction victim is the lowest composite score.
//!
//! Eviction uses a min-heap of scored candidates rebuilt lazily: accesses
//! only mark the heap dirty, and the next eviction rebuilds it from current
//! scores. Popped slots are re-validated against a fresh score and re-pushed
//! if stale, so a burst of evictions between accesses stays logarithmic.
//! Pinned entries (in-flight reads) are never victims.

pub mod writeback;


use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::metalog::types::ShardId;

const FREQUENCY_WEIGHT: f64 = 0.6;
const RECENCY_WEIGHT: f64 = 0.4;
/// Ages up to this score a full 1.0.
const RECENT_WINDOW_SECS: f64 = 300.0;
/// Linear interpolation down to 0.7 until this age.
const MEDIUM_WINDOW_SECS: f64 = 1_800.0;
/// Time constant of the long-tail exponential decay.
const DECAY_TAU_SECS: f64 = 3_600.0;
/// A popped heap slot is trusted only if its score still matches within this.
const SCORE_EPSILON: f64 = 1e-4;

/// Recency component of the eviction score, in [0, 1].
pub fn recency_score(age: Duration) -> f64 {
    let secs = age.as_secs_f64();
    if secs <= RECENT_WINDOW_SECS {
        1.0
    } else if secs <= MEDIUM_WINDOW_SECS {
        1.0 - ((secs - RECENT_WINDOW_SECS) / (MEDIUM_WINDOW_SECS - RECENT_WINDOW_SECS)) * 0.3
    } else {
        0.7 * (-(secs - MEDIUM_WINDOW_SECS) / DECAY_TAU_SECS).exp()
    }
}

/// Composite eviction score. `f_max == 0` (empty cache) degrades the
/// frequency term to zero rather than dividing by `ln(1)`.
pub fn eviction_score(freq: u64, f_max: u64, age: Duration) -> f64 {
    let freq_norm = if f_max > 0 {
        ((1 + freq) as f64).ln() / ((1 + f_max) as f64).ln()
    } else {
        0.0
    };
    FREQUENCY_WEIGHT * freq_norm + RECENCY_WEIGHT * recency_score(age)
}

struct CacheEntry {
    bytes: Bytes,
    freq: u64,
    last_access: Instant,
    pins: u32,
}

struct HeapSlot {
    score: f64,
    id: ShardId,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Scores are always finite (both components live in [0, 1]), and the
        // id tie-break keeps eviction deterministic.
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

struct Inner {
    entries: HashMap<ShardId, CacheEntry>,
    heap: BinaryHeap<Reverse<HeapSlot>>,
    heap_dirty: bool,
    /// Maximum observed access frequency; non-decreasing within an epoch.
    f_max: u64,
}

impl Inner {
    fn score_of(&self, entry: &CacheEntry, now: Instant) -> f64 {
        eviction_score(entry.freq, self.f_max, now.duration_since(entry.last_access))
    }

    fn rebuild_heap(&mut self, now: Instant) {
        let mut heap = BinaryHeap::with_capacity(self.entries.len());
        for (id, entry) in &self.entries {
            heap.push(Reverse(HeapSlot {
                score: eviction_score(
                    entry.freq,
                    self.f_max,
                    now.duration_since(entry.last_access),
                ),
                id: *id,
            }));
        }
        self.heap = heap;
        self.heap_dirty = false;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub f_max: u64,
}

pub struct HybridCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl HybridCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                heap: BinaryHeap::new(),
                heap_dirty: true,
                f_max: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &ShardId) -> bool {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .contains_key(id)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            f_max: inner.f_max,
        }
    }

    pub fn get(&self, id: &ShardId) -> Option<Bytes> {
        self.get_at(id, Instant::now())
    }

    pub fn get_at(&self, id: &ShardId, now: Instant) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let entry = inner.entries.get_mut(id)?;
        entry.freq += 1;
        entry.last_access = now;
        let bytes = entry.bytes.clone();
        let freq = entry.freq;
        inner.f_max = inner.f_max.max(freq);
        inner.heap_dirty = true;
        Some(bytes)
    }

    /// Insert (or refresh) an entry, evicting as needed. Returns the evicted
    /// shard ids, or `None` if the entry could not be admitted because every
    /// resident entry is pinned.
    pub fn insert(&self, id: ShardId, bytes: Bytes) -> Option<Vec<ShardId>> {
        self.insert_at(id, bytes, Instant::now())
    }

    pub fn insert_at(&self, id: ShardId, bytes: Bytes, now: Instant) -> Option<Vec<ShardId>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.bytes = bytes;
            entry.freq += 1;
            entry.last_access = now;
            let freq = entry.freq;
            inner.f_max = inner.f_max.max(freq);
            inner.heap_dirty = true;
            return Some(Vec::new());
        }

        let mut evicted = Vec::new();
        while inner.entries.len() >= self.capacity {
            match evict_lowest(&mut inner, now) {
                Some(victim) => evicted.push(victim),
                None => return None,
            }
        }

        inner.f_max = inner.f_max.max(1);
        inner.entries.insert(
            id,
            CacheEntry {
                bytes,
                freq: 1,
                last_access: now,
                pins: 0,
            },
        );
        inner.heap_dirty = true;
        Some(evicted)
    }

    pub fn remove(&self, id: &ShardId) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let removed = inner.entries.remove(id).map(|e| e.bytes);
        if removed.is_some() {
            inner.heap_dirty = true;
        }
        removed
    }

    /// Keep an entry alive for the duration of an in-flight read.
    pub fn pin(&self, id: &ShardId) -> bool {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match inner.entries.get_mut(id) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, id: &ShardId) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(entry) = inner.entries.get_mut(id) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Epoch reset: halve every frequency counter and `F_max` together.
    /// Optional maintenance; callers may hook it to a timer.
    pub fn halve_frequencies(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        for entry in inner.entries.values_mut() {
            entry.freq = (entry.freq / 2).max(1);
        }
        inner.f_max = if inner.entries.is_empty() {
            0
        } else {
            (inner.f_max / 2).max(1)
        };
        inner.heap_dirty = true;
    }

    /// Resident shard ids with their current scores, lowest first.
    pub fn scored_contents(&self, now: Instant) -> Vec<(ShardId, f64)> {
        let inner = self.inner.lock().expect("cache lock poisoned");
        let mut scored: Vec<(ShardId, f64)> = inner
            .entries
            .iter()
            .map(|(id, e)| (*id, inner.score_of(e, now)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

/// Remove and return the lowest-scored unpinned entry.
///
/// The heap is rebuilt from current scores if anything touched the cache
/// since the last eviction; otherwise popped slots are re-validated against a
/// freshly computed score and re-pushed when stale. Pinned candidates are set
/// aside and restored afterwards. A full scan backstops the loop.
fn evict_lowest(inner: &mut Inner, now: Instant) -> Option<ShardId> {
    if inner.entries.is_empty() {
        return None;
    }
    if inner.heap_dirty || inner.heap.is_empty() {
        inner.rebuild_heap(now);
    }

    let mut deferred: Vec<Reverse<HeapSlot>> = Vec::new();
    let max_iterations = inner.entries.len() * 2 + 4;
    let mut iterations = 0;
    let mut victim = None;

    while iterations < max_iterations {
        iterations += 1;
        let Some(Reverse(slot)) = inner.heap.pop() else {
            break;
        };

        let (current, pinned) = match inner.entries.get(&slot.id) {
            None => continue,
            Some(entry) => (inner.score_of(entry, now), entry.pins > 0),
        };

        if (current - slot.score).abs() > SCORE_EPSILON {
            inner.heap.push(Reverse(HeapSlot {
                score: current,
                id: slot.id,
            }));
            continue;
        }

        if pinned {
            deferred.push(Reverse(slot));
            continue;
        }

        victim = Some(slot.id);
        break;
    }

    for slot in deferred {
        inner.heap.push(slot);
    }

    if let Some(id) = victim {
        inner.entries.remove(&id);
        inner.heap_dirty = true;
        return Some(id);
    }

    // Heap exhausted or iteration guard hit: O(n) scan over unpinned entries.
    let fallback = inner
        .entries
        .iter()
        .filter(|(_, e)| e.pins == 0)
        .map(|(id, e)| (inner.score_of(e, now), *id))
        .min_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        })
        .map(|(_, id)| id);

    if let Some(id) = fallback {
        inner.entries.remove(&id);
        inner.heap_dirty = true;
    }
    fallback
}
