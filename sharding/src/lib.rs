// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster sharding
//!
//! Location-transparent game entities over a cluster of nodes. Entities
//! (players, rooms, matches) are independently addressable, stateful,
//! single-threaded units of computation: each is backed by exactly one
//! live actor cluster-wide, created lazily on first message, passivated
//! when idle, and moved between nodes through coordinated handoffs when
//! membership changes.
//!
//! The moving parts, leaf first:
//!
//! - [`EntityHost`]: the actor executing one entity's commands in order.
//! - [`Shard`]: owns a partition of entity ids on one node; activation,
//!   passivation and handoff draining happen here.
//! - [`ShardRegion`]: the per-node router callers go through; caches the
//!   shard-to-node assignment and forwards to remote owners.
//! - [`ShardCoordinator`]: cluster singleton owning the assignment table,
//!   journaled through the persistence collaborator.
//! - [`ShardedNode`]: wires a node together (membership, regions,
//!   endpoints, coordinator).
//!
//! Game logic only touches [`Entity`] and [`EntityClient`].
//!

mod client;
mod config;
mod coordinator;
mod entity;
mod error;
mod hash;
mod host;
mod node;
mod region;
mod shard;
mod wire;

pub use client::EntityClient;
pub use config::ShardingConfig;
pub use coordinator::{
    AllocationSlot, CoordinatorCommand, CoordinatorEndpoint,
    CoordinatorEvent, CoordinatorResponse, CoordinatorState,
    ShardCoordinator,
};
pub use entity::{
    DeliverySlot, Effects, Entity, EntityId, FollowUp, ReplySlot, ShardId,
};
pub use error::DeliveryError;
pub use hash::{djb2_hash, shard_for_entity};
pub use host::{EntityHost, EntityRequest};
pub use node::ShardedNode;
pub use region::{
    PendingDelivery, RegionCommand, ShardRegion, region_name, region_path,
};
pub use shard::{Shard, ShardCommand, ShardResponse};
pub use wire::{
    CoordinatorAck, CoordinatorWire, RegionAck, RegionEndpoint, RegionWire,
    coordinator_channel, region_channel,
};
