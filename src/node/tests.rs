use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use crate::cache::writeback::WritebackQueue;
use crate::cache::HybridCache;
use crate::error::ClusterError;
use crate::membership::types::NodeId;
use crate::metalog::types::ShardId;
use crate::metrics::Metrics;
use crate::node::load::LoadSampler;
use crate::node::service::NodeService;
use crate::node::store::{digest_hex, ShardStore};
use crate::rpc::RpcClient;

fn sid(n: u64) -> ShardId {
    ShardId(n)
}

// ============================================================
// SHARD STORE
// ============================================================

#[test]
fn store_write_read_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap();

    let payload = b"hello shard".as_slice();
    store.write(sid(1), payload, &digest_hex(payload)).unwrap();

    assert!(store.contains(sid(1)));
    assert_eq!(store.read(sid(1)).unwrap(), Bytes::from_static(payload));
    assert_eq!(store.shard_count(), 1);
    assert_eq!(store.used_bytes(), payload.len() as u64);
    assert_eq!(store.digest(sid(1)).unwrap(), digest_hex(payload));
}

#[test]
fn store_rejects_digest_mismatch() {
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap();

    let err = store
        .write(sid(1), b"payload", &digest_hex(b"other"))
        .unwrap_err();
    assert!(matches!(err, ClusterError::DigestMismatch { shard: 1, .. }));
    // Nothing must land on disk after a rejected write.
    assert!(!store.contains(sid(1)));
    assert_eq!(store.used_bytes(), 0);
}

#[test]
fn store_enforces_high_water_mark() {
    let dir = TempDir::new().unwrap();
    // 100-byte budget, high water at 50%.
    let store = ShardStore::open(dir.path().join("shards"), 100, 0.5).unwrap();

    let small = vec![7u8; 40];
    store.write(sid(1), &small, &digest_hex(&small)).unwrap();

    let too_much = vec![9u8; 20];
    let err = store
        .write(sid(2), &too_much, &digest_hex(&too_much))
        .unwrap_err();
    assert!(matches!(err, ClusterError::OutOfSpace { .. }));
    assert!(!store.contains(sid(2)));
}

#[test]
fn store_delete_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap();

    let payload = b"bytes".as_slice();
    store.write(sid(1), payload, &digest_hex(payload)).unwrap();
    assert!(store.delete(sid(1)).unwrap());
    assert!(!store.delete(sid(1)).unwrap());
    assert_eq!(store.shard_count(), 0);
    assert_eq!(store.used_bytes(), 0);
}

#[test]
fn store_overwrite_adjusts_usage() {
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap();

    let first = vec![1u8; 100];
    store.write(sid(1), &first, &digest_hex(&first)).unwrap();
    let second = vec![2u8; 10];
    store.write(sid(1), &second, &digest_hex(&second)).unwrap();

    assert_eq!(store.shard_count(), 1);
    assert_eq!(store.used_bytes(), 10);
}

#[test]
fn store_open_recovers_counters_and_sweeps_tmp() {
    let dir = TempDir::new().unwrap();
    let shards = dir.path().join("shards");
    {
        let store = ShardStore::open(shards.clone(), 0, 0.9).unwrap();
        let a = vec![1u8; 10];
        let b = vec![2u8; 20];
        store.write(sid(1), &a, &digest_hex(&a)).unwrap();
        store.write(sid(2), &b, &digest_hex(&b)).unwrap();
    }
    // Simulate a crash mid-write.
    std::fs::write(shards.join("3.tmp"), b"partial").unwrap();

    let reopened = ShardStore::open(shards.clone(), 0, 0.9).unwrap();
    assert_eq!(reopened.shard_count(), 2);
    assert_eq!(reopened.used_bytes(), 30);
    assert!(!shards.join("3.tmp").exists());
}

#[test]
fn store_read_missing_is_not_found() {
    let dir = TempDir::new().unwrap();
    let store = ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap();
    assert!(matches!(
        store.read(sid(404)).unwrap_err(),
        ClusterError::NotFound(_)
    ));
}

// ============================================================
// NODE SERVICE
// ============================================================

fn service_fixture(dir: &TempDir, cache_capacity: usize) -> Arc<NodeService> {
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(ShardStore::open(dir.path().join("shards"), 0, 0.9).unwrap());
    let cache = Arc::new(HybridCache::new(cache_capacity));
    let (writeback, _handle) =
        WritebackQueue::start(dir.path().join("cache"), 64, metrics.clone()).unwrap();
    NodeService::new(
        NodeId("127.0.0.1:9001".into()),
        store,
        cache,
        Arc::new(writeback),
        LoadSampler::new(),
        Arc::new(RpcClient::new(metrics.clone())),
        metrics,
    )
}

#[tokio::test]
async fn put_then_get_serves_from_cache() {
    let dir = TempDir::new().unwrap();
    let service = service_fixture(&dir, 8);

    let payload = Bytes::from_static(b"chunk body");
    service
        .put_chunk(sid(1), payload.clone(), &digest_hex(&payload))
        .await
        .unwrap();

    let fetched = service.get_chunk(sid(1)).await.unwrap();
    assert_eq!(fetched, payload);

    let stats = service.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.shard_count, 1);
}

#[tokio::test]
async fn get_miss_reads_disk_and_admits() {
    let dir = TempDir::new().unwrap();
    let service = service_fixture(&dir, 8);

    let payload = Bytes::from_static(b"cold chunk");
    service
        .put_chunk(sid(1), payload.clone(), &digest_hex(&payload))
        .await
        .unwrap();

    // Drop the cached copy; the next read must hit the disk path.
    let fresh = service_fixture(&dir, 8);
    let fetched = fresh.get_chunk(sid(1)).await.unwrap();
    assert_eq!(fetched, payload);
    let stats = fresh.stats();
    assert_eq!(stats.cache_misses, 1);
    // Admitted on the miss: the follow-up read is a hit.
    fresh.get_chunk(sid(1)).await.unwrap();
    assert_eq!(fresh.stats().cache_hits, 1);
}

#[tokio::test]
async fn get_missing_chunk_is_not_found() {
    let dir = TempDir::new().unwrap();
    let service = service_fixture(&dir, 8);
    assert!(matches!(
        service.get_chunk(sid(9)).await.unwrap_err(),
        ClusterError::NotFound(_)
    ));
}

#[tokio::test]
async fn delete_chunk_clears_cache_and_disk() {
    let dir = TempDir::new().unwrap();
    let service = service_fixture(&dir, 8);

    let payload = Bytes::from_static(b"to delete");
    service
        .put_chunk(sid(1), payload.clone(), &digest_hex(&payload))
        .await
        .unwrap();

    assert!(service.delete_chunk(sid(1)).await.unwrap());
    assert!(matches!(
        service.get_chunk(sid(1)).await.unwrap_err(),
        ClusterError::NotFound(_)
    ));
    // Idempotent.
    assert!(!service.delete_chunk(sid(1)).await.unwrap());
}

#[tokio::test]
async fn heartbeat_reports_shard_count() {
    let dir = TempDir::new().unwrap();
    let service = service_fixture(&dir, 8);
    let payload = Bytes::from_static(b"x");
    service
        .put_chunk(sid(1), payload.clone(), &digest_hex(&payload))
        .await
        .unwrap();

    let load = service.heartbeat();
    assert_eq!(load.shard_count, 1);
    assert_eq!(load.disk_used, 1);
    assert!((0.0..=1.0).contains(&load.cpu));
}
