// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Sharding configuration
//!

use std::time::Duration;

/// Knobs of the sharding layer. How the values are loaded is a deployment
/// concern. The shard count must be identical on every node of the
/// cluster and must not change while entities are live.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Number of shards an entity type is partitioned into.
    pub shard_count: u32,
    /// Idle time after which a hosted entity is passivated.
    pub passivate_after: Duration,
    /// Period of the shard's idle-entity scan.
    pub passivation_interval: Duration,
    /// Budget for a caller-visible delivery, end to end.
    pub ask_timeout: Duration,
    /// Budget for one shard-allocation request to the coordinator.
    pub allocation_timeout: Duration,
    /// Delay before a failed allocation request is retried.
    pub allocation_retry_interval: Duration,
    /// Budget for one shard handoff; past it the coordinator
    /// force-releases the shard, accepting state loss.
    pub handoff_timeout: Duration,
    /// Maximum number of shards moving concurrently during a rebalance.
    pub max_concurrent_handoffs: usize,
    /// Maximum messages buffered per region while resolving shard owners;
    /// overflow fails sends with `RegionBusy`.
    pub buffer_capacity: usize,
    /// How long a node may stay unreachable before the coordinator treats
    /// it as down for reassignment purposes.
    pub downing_grace: Duration,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        ShardingConfig {
            shard_count: 10,
            passivate_after: Duration::from_secs(120),
            passivation_interval: Duration::from_secs(5),
            ask_timeout: Duration::from_secs(5),
            allocation_timeout: Duration::from_secs(3),
            allocation_retry_interval: Duration::from_millis(500),
            handoff_timeout: Duration::from_secs(10),
            max_concurrent_handoffs: 3,
            buffer_capacity: 1024,
            downing_grace: Duration::from_secs(10),
        }
    }
}
