// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Entity host
//!
//! The actor backing one live entity instance. The host owns the entity
//! state exclusively: commands are dispatched to [`Entity::on_command`]
//! one at a time, changes are journaled ahead of being applied (for
//! durable entities) and published on the event bus, and follow-up sends
//! re-enter the cluster through the region.
//!
//! A failed command leaves the state exactly as it was — command handlers
//! are pure, so `Resume` needs no rollback. The host applies the entity's
//! restart policy and escalates to its shard once the restart budget is
//! exhausted; the shard then reports the entity as failed permanently.
//!

use crate::{
    entity::{DeliverySlot, Entity, EntityId, FollowUp},
    error::DeliveryError,
    region::{RegionCommand, ShardRegion, region_path},
};

use actor::{
    Actor, ActorContext, ActorPath, ActorRef, Error as ActorError, Handler,
    Message, RestartPolicy,
};
use store::PersistentActor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, error, warn};

/// Requests accepted by an entity host.
#[derive(Debug, Clone)]
pub enum EntityRequest<E: Entity> {
    /// Deliver a command; the outcome resolves through the slot.
    Command {
        command: E::Command,
        slot: DeliverySlot<E>,
    },
    /// Flush and stop. Sent by the shard; ordered after every command the
    /// shard already delivered.
    Passivate,
}

impl<E: Entity> Message for EntityRequest<E> {}

/// The actor hosting one entity instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(
    serialize = "E: Serialize",
    deserialize = "E: DeserializeOwned"
))]
pub struct EntityHost<E: Entity> {
    id: EntityId,
    state: E,
    #[serde(skip, default)]
    restarts: usize,
}

impl<E: Entity> EntityHost<E> {
    /// A host with fresh state; durable entities recover their stored
    /// state during `pre_start`.
    pub fn new(id: EntityId) -> Self {
        let state = E::initialize(&id);
        EntityHost {
            id,
            state,
            restarts: 0,
        }
    }

    /// Read access to the hosted state (used by tests and diagnostics).
    pub fn state(&self) -> &E {
        &self.state
    }

    /// Dispatches follow-up sends through the region, off the handler.
    fn dispatch_followups(
        &self,
        followups: Vec<FollowUp<E>>,
        ctx: &ActorContext<Self>,
    ) {
        let system = ctx.system().clone();
        for followup in followups {
            let system = system.clone();
            tokio::spawn(async move {
                if let Some(after) = followup.after {
                    tokio::time::sleep(after).await;
                }
                let region: Option<ActorRef<ShardRegion<E>>> =
                    system.get_actor(&region_path::<E>()).await;
                let Some(region) = region else {
                    warn!(
                        "No region for {} to dispatch follow-up.",
                        E::TYPE
                    );
                    return;
                };
                let _ = region
                    .tell(RegionCommand::Route {
                        entity_id: followup.to,
                        command: followup.command,
                        slot: DeliverySlot::<E>::discard(),
                    })
                    .await;
            });
        }
    }

    /// Applies the entity's restart policy after a failed command.
    async fn on_command_failure(
        &mut self,
        error: ActorError,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        self.restarts += 1;
        let exhausted = self.restarts > E::max_restarts();
        let policy = E::restart_policy();

        if exhausted || policy == RestartPolicy::Stop {
            warn!(
                "Entity {} failed permanently after {} failures: {}",
                self.id, self.restarts, error
            );
            ctx.emit_fail(ActorError::FailedPermanently(
                ctx.path().clone(),
                error.to_string(),
            ))
            .await?;
            return Ok(());
        }

        match policy {
            RestartPolicy::Resume => {
                // Command handlers are pure, so the state is still the one
                // produced by the last successful command.
                debug!("Entity {} resuming after failure: {}", self.id, error);
            }
            RestartPolicy::RestartClean => {
                debug!(
                    "Entity {} restarting clean after failure: {}",
                    self.id, error
                );
                self.state = E::initialize(&self.id);
                if E::DURABLE {
                    if let Err(e) = self.purge_store(ctx).await {
                        error!(
                            "Entity {} can't purge its store: {}",
                            self.id, e
                        );
                    }
                }
            }
            RestartPolicy::Stop => unreachable!("handled above"),
        }
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> Actor for EntityHost<E> {
    type Message = EntityRequest<E>;
    type Response = ();
    type Event = E::Change;

    async fn pre_start(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        if E::DURABLE {
            // Activation boundary: recover the last flushed state.
            self.start_store(E::TYPE, Some(self.id.to_string()), ctx)
                .await?;
        }
        debug!("Entity {} of type {} activated.", self.id, E::TYPE);
        Ok(())
    }

    async fn pre_stop(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        if E::DURABLE {
            // Passivation boundary: flush the state before stopping.
            self.stop_store(ctx).await?;
        }
        debug!("Entity {} of type {} passivated.", self.id, E::TYPE);
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> PersistentActor for EntityHost<E> {
    fn apply(&mut self, event: &E::Change) {
        self.state.apply(event);
    }
}

#[async_trait]
impl<E: Entity> Handler<EntityHost<E>> for EntityHost<E> {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: EntityRequest<E>,
        ctx: &mut ActorContext<EntityHost<E>>,
    ) -> Result<(), ActorError> {
        match msg {
            EntityRequest::Command { command, slot } => {
                match self.state.on_command(&self.id, command) {
                    Ok(effects) => {
                        for change in &effects.changes {
                            if E::DURABLE {
                                // Write-ahead: the change is journaled
                                // before it is applied. A storage failure
                                // stops the host rather than risking a
                                // state that diverges from the journal.
                                if let Err(e) =
                                    self.persist(change, ctx).await
                                {
                                    error!(
                                        "Entity {} can't persist change: {}",
                                        self.id, e
                                    );
                                    slot.send(Err(
                                        DeliveryError::Unavailable(
                                            e.to_string(),
                                        ),
                                    ));
                                    ctx.emit_fail(e).await?;
                                    return Ok(());
                                }
                            } else {
                                self.state.apply(change);
                            }
                            let _ =
                                ctx.publish_event(change.clone()).await;
                        }
                        self.restarts = 0;
                        match effects.reply {
                            Some(outcome) => slot.send(Ok(outcome)),
                            None => slot.send(Err(DeliveryError::NoReply(
                                self.id.clone(),
                            ))),
                        }
                        if !effects.followups.is_empty() {
                            self.dispatch_followups(effects.followups, ctx);
                        }
                        Ok(())
                    }
                    Err(failure) => {
                        slot.send(Err(DeliveryError::Handler(
                            failure.to_string(),
                        )));
                        self.on_command_failure(failure, ctx).await?;
                        Ok(())
                    }
                }
            }
            EntityRequest::Passivate => {
                ctx.stop(None).await;
                Ok(())
            }
        }
    }
}
