//! Coordinator ("SuperNode") Module
//!
//! The single well-known endpoint clients speak to. Maintains the cluster
//! view through the failure detector, resolves file -> shard -> node
//! placements, drives uploads and downloads end to end, and forwards every
//! metadata mutation to the current log leader.
//!
//! ## Core Concepts
//! - **Sharding**: uploads are buffered into fixed-size chunks; each chunk
//!   becomes a shard with a fresh monotone id.
//! - **Placement**: each shard lands on the R least-loaded Active nodes,
//!   PUT in parallel; a failed primary gets one retry on a fresh node.
//! - **Commit-before-ack**: the client sees success only after the
//!   `FilePut` record is committed by the metadata quorum.
//! - **Repair**: a background worker restores replica counts after node
//!   failures, one shard at a time with per-shard backoff.

pub mod handlers;
pub mod protocol;
pub mod repair;
pub mod service;
pub mod sharding;
