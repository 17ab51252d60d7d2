//! Membership & Failure Detection Module
//!
//! The coordinator owns the authoritative view of which nodes are alive.
//! Unlike gossip systems, detection here is pull-model: the coordinator polls
//! every configured node's heartbeat endpoint each interval and drives a
//! `Joining -> Active -> Suspect -> Dead` state machine from the results.
//!
//! ## Core Mechanisms
//! - **Heartbeat polling**: short-deadline (200 ms) GETs so a slow node is
//!   demoted quickly instead of stalling the detector.
//! - **Two-phase failure**: a node turns Suspect after a configured number of
//!   consecutive misses and Dead only after a further timeout, avoiding false
//!   positives on transient blips.
//! - **Recovery without re-admission**: a Dead node that answers again
//!   becomes a placement candidate, but shards it lost stay with whoever the
//!   repair worker gave them to.

pub mod service;
pub mod types;

#[cfg(test)]
mod tests;
