// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Entity client
//!
//! The handle game-logic collaborators use to talk to entities. A client
//! is cheap to clone and hides the entity's location entirely: it sends
//! through the local region and awaits an explicit outcome within its
//! timeout budget. Transient routing outcomes (`ShardStopping`,
//! `NotOwner`) are retried inside the budget, so a caller only observes
//! them if a handoff outlives the budget itself.
//!

use crate::{
    entity::{Entity, EntityId, ReplySlot},
    error::DeliveryError,
    region::{RegionCommand, ShardRegion},
};

use actor::ActorRef;

use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use std::time::Duration;

/// Delay between retries of a transiently failed delivery.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Caller-facing handle for one entity type.
pub struct EntityClient<E: Entity> {
    region: ActorRef<ShardRegion<E>>,
    budget: Duration,
}

impl<E: Entity> EntityClient<E> {
    pub fn new(region: ActorRef<ShardRegion<E>>, budget: Duration) -> Self {
        EntityClient { region, budget }
    }

    /// Sends a command and awaits the entity's reply.
    pub async fn send(
        &self,
        entity_id: impl Into<EntityId>,
        command: E::Command,
    ) -> Result<E::Outcome, DeliveryError> {
        let entity_id = entity_id.into();
        let deadline = Instant::now() + self.budget;
        loop {
            let (slot, receiver) = ReplySlot::channel();
            self.region
                .tell(RegionCommand::Route {
                    entity_id: entity_id.clone(),
                    command: command.clone(),
                    slot,
                })
                .await
                .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

            let remaining =
                deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, receiver).await {
                Err(_elapsed) => {
                    return Err(DeliveryError::Timeout(format!(
                        "no outcome for {} within {:?}",
                        entity_id, self.budget
                    )));
                }
                Ok(Err(_closed)) => {
                    return Err(DeliveryError::Unavailable(
                        "delivery dropped".to_owned(),
                    ));
                }
                Ok(Ok(Err(
                    error @ (DeliveryError::ShardStopping(_)
                    | DeliveryError::NotOwner(_)),
                ))) => {
                    // Transient: the shard is moving. Retry once the
                    // region has re-resolved the owner.
                    debug!(
                        "Retrying delivery to {} after: {}",
                        entity_id, error
                    );
                    if Instant::now() + RETRY_DELAY >= deadline {
                        return Err(DeliveryError::Timeout(format!(
                            "shard kept moving for {}",
                            entity_id
                        )));
                    }
                    sleep(RETRY_DELAY).await;
                }
                Ok(Ok(result)) => return result,
            }
        }
    }

    /// Sends a command without waiting for a reply. Delivery still goes
    /// through the same routing; failures are dropped.
    pub async fn notify(
        &self,
        entity_id: impl Into<EntityId>,
        command: E::Command,
    ) -> Result<(), DeliveryError> {
        self.region
            .tell(RegionCommand::Route {
                entity_id: entity_id.into(),
                command,
                slot: ReplySlot::discard(),
            })
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))
    }
}

impl<E: Entity> Clone for EntityClient<E> {
    fn clone(&self) -> Self {
        EntityClient {
            region: self.region.clone(),
            budget: self.budget,
        }
    }
}
