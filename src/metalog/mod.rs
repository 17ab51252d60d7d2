//! Replicated Metadata Log Module
//!
//! The authoritative mapping from `(owner, file)` to shards and replica sets
//! lives in a totally ordered, quorum-replicated log over the storage nodes.
//! In-memory maps are materialized views of the committed prefix.
//!
//! ## Core Concepts
//! - **Leader-based append**: only the elected leader accepts writes; it
//!   replicates to followers and commits on majority persistence.
//! - **Durable segments**: the log lives in append-only segment files with a
//!   per-record crc32c trailer; a torn tail truncates cleanly on replay.
//! - **Snapshot reads**: readers clone an `Arc` of the materialized view,
//!   so lookups never contend with the apply path.
//! - **Idempotent submission**: every client append carries an op id; the
//!   leader answers duplicates with the original committed index.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod raft;
pub mod segment;
pub mod types;
pub mod view;

#[cfg(test)]
mod tests;
