//! Distributed Object-Storage Cluster Library
//!
//! This library crate defines the core modules of the storage cluster. It
//! serves as the foundation for the binary executable (`main.rs`), which
//! starts a process in either the `node` or the `coordinator` role.
//!
//! ## Architecture Modules
//! The system is composed of the following subsystems:
//!
//! - **`node`**: The storage node. Owns a local shard directory and the
//!   hybrid cache, and serves chunk put/get/delete, heartbeat, and
//!   pull-replication over HTTP RPC.
//! - **`cache`**: Hybrid LRU+LFU cache with score-based eviction
//!   (log-normalized frequency + piecewise recency decay) and a
//!   non-blocking writeback queue for cache-line admission.
//! - **`coordinator`**: The well-known endpoint clients speak to. Shards
//!   uploads, places replicas by load score, reconstitutes downloads, and
//!   runs the replication repair worker.
//! - **`membership`**: Pull-model heartbeat failure detector driving the
//!   `Joining -> Active -> Suspect -> Dead` state machine.
//! - **`placement`**: Load scoring and deterministic replica selection.
//! - **`metalog`**: Quorum-replicated metadata log with leader election,
//!   checksummed on-disk segments and a copy-on-write materialized view.
//! - **`config`** / **`error`** / **`metrics`** / **`rpc`**: the shared
//!   configuration document, error taxonomy, metrics registry and HTTP RPC
//!   plumbing.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod membership;
pub mod metalog;
pub mod metrics;
pub mod node;
pub mod placement;
pub mod rpc;
