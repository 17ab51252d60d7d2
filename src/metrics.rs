//! Process metrics registry.
//!
//! Counters and histograms for every component, rendered in Prometheus text
//! exposition format at `GET /metrics`. The registry is constructed once in
//! `main` and handed to each component by parameter; nothing here is a global.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: u64) {
        self.0.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram. Observation sums are kept in micro-units so the
/// hot path stays a pair of atomic adds.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(bounds: Vec<f64>) -> Self {
        let buckets = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            buckets,
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| value <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1e6) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str) {
        let mut cumulative = 0u64;
        for (i, bound) in self.bounds.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
        }
        cumulative += self.buckets[self.bounds.len()].load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{name}_sum {sum}");
        let _ = writeln!(out, "{name}_count {}", self.count());
    }
}

#[derive(Debug)]
pub struct Metrics {
    // Cache
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_evictions: Counter,
    pub cache_size: Gauge,
    pub cache_capacity: Gauge,
    pub writeback_depth: Gauge,
    pub writeback_bypass: Counter,

    // Replication
    pub replication_attempts: Counter,
    pub replication_success: Counter,
    pub replication_failures: Counter,
    pub chunks_replicated: Counter,

    // Placement
    pub placement_decisions: DashMap<String, Counter>,

    // Membership
    pub active_nodes: Gauge,
    pub total_nodes: Gauge,
    pub node_failures: Counter,
    pub node_recoveries: Counter,
    pub heartbeat_checks: Counter,
    pub heartbeat_failures: Counter,

    // Metadata log
    pub leader_changes: Counter,
    pub elections: Counter,
    pub log_appends: Counter,

    // Coordinator
    pub uploads: Counter,
    pub downloads: Counter,
    pub deletes: Counter,
    pub shards_created: Counter,

    pub errors: DashMap<&'static str, Counter>,

    pub rpc_latency_seconds: Histogram,
    pub shard_size_bytes: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            cache_evictions: Counter::default(),
            cache_size: Gauge::default(),
            cache_capacity: Gauge::default(),
            writeback_depth: Gauge::default(),
            writeback_bypass: Counter::default(),
            replication_attempts: Counter::default(),
            replication_success: Counter::default(),
            replication_failures: Counter::default(),
            chunks_replicated: Counter::default(),
            placement_decisions: DashMap::new(),
            active_nodes: Gauge::default(),
            total_nodes: Gauge::default(),
            node_failures: Counter::default(),
            node_recoveries: Counter::default(),
            heartbeat_checks: Counter::default(),
            heartbeat_failures: Counter::default(),
            leader_changes: Counter::default(),
            elections: Counter::default(),
            log_appends: Counter::default(),
            uploads: Counter::default(),
            downloads: Counter::default(),
            deletes: Counter::default(),
            shards_created: Counter::default(),
            errors: DashMap::new(),
            rpc_latency_seconds: Histogram::new(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            shard_size_bytes: Histogram::new(vec![
                1024.0,
                10_240.0,
                102_400.0,
                1_048_576.0,
                10_485_760.0,
                52_428_800.0,
            ]),
        }
    }

    pub fn record_placement(&self, node: &str) {
        self.placement_decisions
            .entry(node.to_string())
            .or_default()
            .inc();
    }

    pub fn record_error(&self, kind: &'static str) {
        self.errors.entry(kind).or_default().inc();
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get();
        let total = hits + self.cache_misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Prometheus text exposition.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counters: [(&str, &Counter); 18] = [
            ("cache_hits_total", &self.cache_hits),
            ("cache_misses_total", &self.cache_misses),
            ("cache_evictions_total", &self.cache_evictions),
            ("writeback_bypass_total", &self.writeback_bypass),
            ("replication_attempts_total", &self.replication_attempts),
            ("replication_success_total", &self.replication_success),
            ("replication_failures_total", &self.replication_failures),
            ("replicated_chunks_total", &self.chunks_replicated),
            ("node_failures_total", &self.node_failures),
            ("node_recoveries_total", &self.node_recoveries),
            ("heartbeat_checks_total", &self.heartbeat_checks),
            ("heartbeat_failures_total", &self.heartbeat_failures),
            ("leader_changes_total", &self.leader_changes),
            ("elections_total", &self.elections),
            ("log_appends_total", &self.log_appends),
            ("uploads_total", &self.uploads),
            ("downloads_total", &self.downloads),
            ("deletes_total", &self.deletes),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "{name} {}", counter.get());
        }
        let _ = writeln!(out, "shards_created_total {}", self.shards_created.get());

        let gauges: [(&str, &Gauge); 5] = [
            ("cache_size", &self.cache_size),
            ("cache_capacity", &self.cache_capacity),
            ("writeback_queue_depth", &self.writeback_depth),
            ("active_nodes_count", &self.active_nodes),
            ("total_nodes_count", &self.total_nodes),
        ];
        for (name, gauge) in gauges {
            let _ = writeln!(out, "{name} {}", gauge.get());
        }

        for entry in self.placement_decisions.iter() {
            let _ = writeln!(
                out,
                "placement_decisions_total{{node=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }
        for entry in self.errors.iter() {
            let _ = writeln!(
                out,
                "errors_total{{kind=\"{}\"}} {}",
                entry.key(),
                entry.value().get()
            );
        }

        self.rpc_latency_seconds
            .render(&mut out, "rpc_latency_seconds");
        self.shard_size_bytes.render(&mut out, "shard_size_bytes");
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /metrics` handler shared by every role.
pub async fn handle_metrics(
    axum::extract::Extension(metrics): axum::extract::Extension<std::sync::Arc<Metrics>>,
) -> String {
    metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_gauge() {
        let m = Metrics::new();
        m.cache_hits.inc();
        m.cache_hits.inc();
        m.cache_misses.inc();
        m.cache_size.set(7);
        assert_eq!(m.cache_hits.get(), 2);
        assert!((m.cache_hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(m.cache_size.get(), 7);
    }

    #[test]
    fn hit_rate_with_no_traffic_is_zero() {
        let m = Metrics::new();
        assert_eq!(m.cache_hit_rate(), 0.0);
    }

    #[test]
    fn histogram_buckets_cumulative() {
        let h = Histogram::new(vec![0.1, 1.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(5.0);
        assert_eq!(h.count(), 3);
        let mut out = String::new();
        h.render(&mut out, "t");
        assert!(out.contains("t_bucket{le=\"0.1\"} 1"));
        assert!(out.contains("t_bucket{le=\"1\"} 2"));
        assert!(out.contains("t_bucket{le=\"+Inf\"} 3"));
    }

    #[test]
    fn render_includes_labelled_series() {
        let m = Metrics::new();
        m.record_placement("127.0.0.1:9001");
        m.record_error("timeout");
        let text = m.render();
        assert!(text.contains("placement_decisions_total{node=\"127.0.0.1:9001\"} 1"));
        assert!(text.contains("errors_total{kind=\"timeout\"} 1"));
        assert!(text.contains("cache_hits_total 0"));
    }
}
