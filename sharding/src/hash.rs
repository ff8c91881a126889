// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Shard hashing
//!
//! Deterministic entity-to-shard mapping. The shard of an entity is stable
//! for the entity's lifetime: it only changes if the shard count changes,
//! which is a cluster-wide redeployment decision.
//!

use crate::entity::{EntityId, ShardId};

/// DJB2 hash. Deterministic across platforms and versions, which is what
/// the shard mapping needs; cryptographic strength is not.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Computes the shard that owns an entity id.
///
/// # Panics
///
/// Panics if `shard_count` is zero.
pub fn shard_for_entity(id: &EntityId, shard_count: u32) -> ShardId {
    assert!(shard_count >= 1, "shard_count must be >= 1");
    ShardId(djb2_hash(id.as_str().as_bytes()) % shard_count)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn deterministic() {
        let h1 = djb2_hash(b"player-42");
        let h2 = djb2_hash(b"player-42");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(djb2_hash(b"player-42"), djb2_hash(b"player-43"));
    }

    #[test]
    fn shard_in_range() {
        for i in 0..1000 {
            let id = EntityId::from(format!("entity-{}", i).as_str());
            let shard = shard_for_entity(&id, 30);
            assert!(shard.0 < 30);
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let shard_count = 30;
        let keys = 10_000;
        let mut counts = vec![0u32; shard_count as usize];
        for i in 0..keys {
            let id = EntityId::from(format!("entity-{}", i).as_str());
            counts[shard_for_entity(&id, shard_count).0 as usize] += 1;
        }
        let expected = keys as f64 / shard_count as f64;
        let max_allowed = (expected * 2.0) as u32;
        for (shard, &count) in counts.iter().enumerate() {
            assert!(
                count <= max_allowed,
                "shard {} has {} entities, expected at most {}",
                shard,
                count,
                max_allowed
            );
        }
    }

    #[test]
    #[should_panic(expected = "shard_count must be >= 1")]
    fn zero_shards_panics() {
        shard_for_entity(&EntityId::from("x"), 0);
    }
}
