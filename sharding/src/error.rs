// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Delivery errors
//!
//! Every message sent towards an entity resolves to an explicit outcome
//! within its timeout budget; these are the failure outcomes a caller can
//! observe. `ShardStopping` and `NotOwner` are transient and handled by the
//! region's rerouting; the others surface to the caller.
//!

use crate::entity::{EntityId, ShardId};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure outcomes of entity message delivery.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum DeliveryError {
    /// The region's resolution buffer is full; back off and retry.
    #[error("Region is busy, retry later.")]
    RegionBusy,
    /// The shard is mid-handoff on this node; the region retries against
    /// the new owner.
    #[error("Shard {0} is stopping.")]
    ShardStopping(ShardId),
    /// The node is not the current owner of the shard.
    #[error("Not the owner of shard {0}.")]
    NotOwner(ShardId),
    /// The entity exhausted its restart budget and was stopped.
    #[error("Entity {0} failed permanently.")]
    EntityFailed(EntityId),
    /// The entity's command handler rejected the command.
    #[error("Handler failure: {0}")]
    Handler(String),
    /// No outcome was observed within the timeout budget.
    #[error("Delivery timed out: {0}")]
    Timeout(String),
    /// The command produced no reply to return to the asker.
    #[error("Entity {0} produced no reply.")]
    NoReply(EntityId),
    /// Delivery infrastructure failure (routing, transport, encoding).
    #[error("Delivery unavailable: {0}")]
    Unavailable(String),
}
