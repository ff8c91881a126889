// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster configuration
//!

use std::time::Duration;

/// Knobs of the membership layer. How the values are loaded is a
/// deployment concern; the defaults suit small clusters.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Period of the gossip tick (view exchange and heartbeats).
    pub gossip_interval: Duration,
    /// Number of random peers contacted per gossip round.
    pub gossip_fanout: usize,
    /// Expected heartbeat period used by the failure detector.
    pub heartbeat_interval: Duration,
    /// Missed heartbeats after which a peer is locally suspected.
    pub missed_heartbeats: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            gossip_interval: Duration::from_secs(1),
            gossip_fanout: 3,
            heartbeat_interval: Duration::from_secs(1),
            missed_heartbeats: 3,
        }
    }
}
