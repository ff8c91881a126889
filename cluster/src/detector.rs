// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Failure detector
//!
//! Fixed-threshold heartbeat detector: a peer is suspected after
//! `missed_heartbeats` expected heartbeats have not been observed. A
//! suspicion is local; the membership view only declares a node unreachable
//! once a quorum of observers agrees.
//!

use crate::node::NodeId;

use std::{
    collections::{BTreeSet, HashMap},
    time::{Duration, Instant},
};

/// Local heartbeat bookkeeping for the peers a node watches.
#[derive(Debug)]
pub struct FailureDetector {
    heartbeat_interval: Duration,
    missed_heartbeats: u32,
    last_seen: HashMap<NodeId, Instant>,
}

impl FailureDetector {
    pub fn new(heartbeat_interval: Duration, missed_heartbeats: u32) -> Self {
        FailureDetector {
            heartbeat_interval,
            missed_heartbeats,
            last_seen: HashMap::new(),
        }
    }

    /// Records a sign of life from the peer.
    pub fn heartbeat(&mut self, node: &NodeId, now: Instant) {
        self.last_seen.insert(node.clone(), now);
    }

    /// Starts watching a peer, counting from `now` if it was unknown.
    pub fn watch(&mut self, node: &NodeId, now: Instant) {
        self.last_seen.entry(node.clone()).or_insert(now);
    }

    /// Stops watching a peer.
    pub fn forget(&mut self, node: &NodeId) {
        self.last_seen.remove(node);
    }

    /// The deadline after which a silent peer becomes suspect.
    fn deadline(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }

    /// Peers whose last sign of life is older than the deadline.
    pub fn suspects(&self, now: Instant) -> BTreeSet<NodeId> {
        self.last_seen
            .iter()
            .filter(|(_, last)| {
                now.duration_since(**last) > self.deadline()
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_silent_peer_becomes_suspect() {
        let mut detector =
            FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = NodeId::from("b");
        detector.heartbeat(&peer, start);

        assert!(detector.suspects(start).is_empty());
        // Inside the deadline: still trusted.
        assert!(
            detector
                .suspects(start + Duration::from_millis(250))
                .is_empty()
        );
        // Past three missed heartbeats: suspect.
        let suspects = detector.suspects(start + Duration::from_millis(350));
        assert!(suspects.contains(&peer));
    }

    #[test]
    fn test_renewed_contact_clears_suspicion() {
        let mut detector =
            FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = NodeId::from("b");
        detector.heartbeat(&peer, start);

        let late = start + Duration::from_millis(400);
        assert!(detector.suspects(late).contains(&peer));

        detector.heartbeat(&peer, late);
        assert!(detector.suspects(late).is_empty());
    }

    #[test]
    fn test_watch_does_not_reset_known_peer() {
        let mut detector =
            FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = NodeId::from("b");
        detector.heartbeat(&peer, start);
        // Watching again later must not refresh the deadline.
        detector.watch(&peer, start + Duration::from_millis(400));
        assert!(
            detector
                .suspects(start + Duration::from_millis(400))
                .contains(&peer)
        );
    }

    #[test]
    fn test_forget() {
        let mut detector =
            FailureDetector::new(Duration::from_millis(100), 3);
        let start = Instant::now();
        let peer = NodeId::from("b");
        detector.heartbeat(&peer, start);
        detector.forget(&peer);
        assert!(
            detector
                .suspects(start + Duration::from_secs(10))
                .is_empty()
        );
    }
}
