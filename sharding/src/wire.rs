// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Wire protocol
//!
//! Serialized messages exchanged between nodes: entity deliveries between
//! regions, allocation requests towards the coordinator, and the
//! coordinator's handoff and cache-invalidation pushes. Commands and
//! outcomes travel as opaque bincode payloads so the envelope types stay
//! independent of any entity type.
//!
//! The transport is at-least-once with no cross-connection ordering, so
//! every message here is idempotent or version-guarded at the receiver:
//! re-delivering a handoff to a shard that already stopped, or an
//! allocation request for an assigned shard, only reconfirms the outcome.
//!

use crate::{
    entity::{Entity, EntityId, ReplySlot, ShardId},
    error::DeliveryError,
    region::{RegionCommand, ShardRegion},
};

use actor::ActorRef;
use cluster::{Error as ClusterError, FrameHandler, NodeId};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use std::time::Duration;

/// Transport channel of the region endpoint of an entity type.
pub fn region_channel(entity_type: &str) -> String {
    format!("shard/{}", entity_type)
}

/// Transport channel of the coordinator endpoint of an entity type.
pub fn coordinator_channel(entity_type: &str) -> String {
    format!("coordinator/{}", entity_type)
}

/// Messages addressed to a region endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionWire {
    /// Deliver a command to an entity hosted by the receiving node.
    Route {
        entity_id: EntityId,
        shard: ShardId,
        command: Vec<u8>,
    },
    /// The shard's owner changed; invalidate the cache entry.
    ShardHomeChanged { shard: ShardId, owner: NodeId },
    /// Coordinator instruction: stop hosting the shard and acknowledge
    /// once every entity has stopped.
    Handoff { shard: ShardId },
}

/// Replies of a region endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionAck {
    /// The entity's reply, bincode-encoded.
    Outcome(Vec<u8>),
    /// Acknowledged (home change applied, handoff completed).
    Ack,
    /// The delivery failed with an explicit outcome.
    Error(DeliveryError),
}

/// Messages addressed to a coordinator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorWire {
    /// Who owns this shard? Assigns it if nobody does.
    Allocate { shard: ShardId, requester: NodeId },
}

/// Replies of a coordinator endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorAck {
    Allocated { shard: ShardId, owner: NodeId },
    Error(DeliveryError),
}

fn codec_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Codec(e.to_string())
}

/// Transport endpoint bridging region frames into the region's mailbox.
pub struct RegionEndpoint<E: Entity> {
    region: ActorRef<ShardRegion<E>>,
    ask_timeout: Duration,
    handoff_timeout: Duration,
}

impl<E: Entity> RegionEndpoint<E> {
    pub fn new(
        region: ActorRef<ShardRegion<E>>,
        ask_timeout: Duration,
        handoff_timeout: Duration,
    ) -> Self {
        RegionEndpoint {
            region,
            ask_timeout,
            handoff_timeout,
        }
    }
}

#[async_trait]
impl<E: Entity> FrameHandler for RegionEndpoint<E> {
    async fn on_frame(
        &self,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ClusterError> {
        let wire: RegionWire =
            bincode::deserialize(&payload).map_err(codec_err)?;
        let ack = match wire {
            RegionWire::Route {
                entity_id,
                shard: _,
                command,
            } => {
                let command: E::Command = match bincode::deserialize(&command)
                {
                    Ok(command) => command,
                    Err(e) => {
                        return bincode::serialize(&RegionAck::Error(
                            DeliveryError::Unavailable(e.to_string()),
                        ))
                        .map_err(codec_err);
                    }
                };
                let (slot, receiver) = ReplySlot::channel();
                if self
                    .region
                    .tell(RegionCommand::Ingress {
                        entity_id,
                        command,
                        slot,
                    })
                    .await
                    .is_err()
                {
                    RegionAck::Error(DeliveryError::Unavailable(
                        "region is gone".to_owned(),
                    ))
                } else {
                    match tokio::time::timeout(self.ask_timeout, receiver)
                        .await
                    {
                        Ok(Ok(Ok(outcome))) => RegionAck::Outcome(
                            bincode::serialize(&outcome)
                                .map_err(codec_err)?,
                        ),
                        Ok(Ok(Err(error))) => RegionAck::Error(error),
                        Ok(Err(_closed)) => {
                            RegionAck::Error(DeliveryError::Unavailable(
                                "delivery dropped".to_owned(),
                            ))
                        }
                        Err(_elapsed) => RegionAck::Error(
                            DeliveryError::Timeout(
                                "delivery not acknowledged in time"
                                    .to_owned(),
                            ),
                        ),
                    }
                }
            }
            RegionWire::ShardHomeChanged { shard, owner } => {
                let _ = self
                    .region
                    .tell(RegionCommand::ShardHome { shard, owner })
                    .await;
                RegionAck::Ack
            }
            RegionWire::Handoff { shard } => {
                let (slot, receiver) = ReplySlot::channel();
                if self
                    .region
                    .tell(RegionCommand::HandoffShard { shard, slot })
                    .await
                    .is_err()
                {
                    RegionAck::Error(DeliveryError::Unavailable(
                        "region is gone".to_owned(),
                    ))
                } else {
                    match tokio::time::timeout(self.handoff_timeout, receiver)
                        .await
                    {
                        Ok(Ok(Ok(()))) => RegionAck::Ack,
                        Ok(Ok(Err(error))) => RegionAck::Error(error),
                        Ok(Err(_closed)) => {
                            RegionAck::Error(DeliveryError::Unavailable(
                                "handoff dropped".to_owned(),
                            ))
                        }
                        Err(_elapsed) => RegionAck::Error(
                            DeliveryError::Timeout(
                                "handoff not acknowledged in time"
                                    .to_owned(),
                            ),
                        ),
                    }
                }
            }
        };
        bincode::serialize(&ack).map_err(codec_err)
    }
}
