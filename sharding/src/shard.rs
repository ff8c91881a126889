// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Shard
//!
//! A shard owns a disjoint partition of entity ids on one node. Entity
//! hosts are its child actors: created lazily on first delivery, stopped
//! by the idle-passivation scan, and drained during handoff. Because every
//! delivery to a host is enqueued from the shard's own handler, the order
//! in which the shard processes deliveries is the order each host sees.
//!
//! During a passivation the shard buffers deliveries for the stopping
//! entity and redelivers them, in order, to the fresh incarnation — a
//! message never observes a half-stopped host. During handoff the shard
//! rejects deliveries with `ShardStopping` and acknowledges only after
//! every host has fully stopped, which closes the dual-hosting window.
//!

use crate::{
    config::ShardingConfig,
    entity::{DeliverySlot, Entity, EntityId, ShardId},
    error::DeliveryError,
    host::{EntityHost, EntityRequest},
};

use actor::{
    Actor, ActorContext, ActorPath, ChildAction, Error as ActorError,
    Handler, Message, Response,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};

/// Commands accepted by a shard.
#[derive(Debug, Clone)]
pub enum ShardCommand<E: Entity> {
    /// Deliver a command to an entity of this shard, activating it if
    /// needed.
    Deliver {
        entity_id: EntityId,
        command: E::Command,
        slot: DeliverySlot<E>,
    },
    /// Periodic idle-entity scan.
    PassivateIdle,
    /// A passivating host has fully stopped.
    EntityStopped(EntityId),
    /// Stop hosting: drain and flush every entity, then acknowledge.
    Handoff,
}

impl<E: Entity> Message for ShardCommand<E> {}

/// Responses of a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardResponse {
    /// The delivery was accepted (its outcome travels through the slot).
    Delivered,
    /// Handoff completed: every host has stopped.
    Stopped,
    /// Nothing to report.
    None,
}

impl Response for ShardResponse {}

/// Hosting state of one entity id.
enum EntityEntry<E: Entity> {
    /// A live host exists.
    Active { last_active: Instant },
    /// The host is stopping; deliveries are buffered for redelivery.
    Passivating {
        buffer: VecDeque<(E::Command, DeliverySlot<E>)>,
    },
    /// The entity exhausted its restart budget; deliveries are rejected.
    Failed,
}

/// The shard actor.
pub struct Shard<E: Entity> {
    id: ShardId,
    config: ShardingConfig,
    entities: HashMap<EntityId, EntityEntry<E>>,
    stopping: bool,
    cancel: CancellationToken,
}

impl<E: Entity> Shard<E> {
    pub fn new(id: ShardId, config: ShardingConfig) -> Self {
        Shard {
            id,
            config,
            entities: HashMap::new(),
            stopping: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Activates the entity (if needed) and enqueues the command into its
    /// host mailbox. Enqueueing happens inside the shard handler, so the
    /// shard's processing order is the host's delivery order.
    async fn deliver(
        &mut self,
        entity_id: EntityId,
        command: E::Command,
        slot: DeliverySlot<E>,
        ctx: &mut ActorContext<Self>,
    ) {
        if self.stopping {
            slot.send(Err(DeliveryError::ShardStopping(self.id)));
            return;
        }
        match self.entities.get_mut(&entity_id) {
            Some(EntityEntry::Failed) => {
                slot.send(Err(DeliveryError::EntityFailed(entity_id)));
            }
            Some(EntityEntry::Passivating { buffer }) => {
                buffer.push_back((command, slot));
            }
            Some(EntityEntry::Active { last_active }) => {
                *last_active = Instant::now();
                let host = ctx
                    .get_child::<EntityHost<E>>(entity_id.as_str())
                    .await;
                match host {
                    Some(host) => {
                        if host
                            .tell(EntityRequest::Command { command, slot })
                            .await
                            .is_err()
                        {
                            warn!(
                                "Host for {} on shard {} is closed.",
                                entity_id, self.id
                            );
                            self.entities.remove(&entity_id);
                        }
                    }
                    None => {
                        // The host is gone without the shard noticing
                        // (stopped by supervision); reactivate on the
                        // spot.
                        self.entities.remove(&entity_id);
                        self.activate_and_deliver(
                            entity_id, command, slot, ctx,
                        )
                        .await;
                    }
                }
            }
            None => {
                self.activate_and_deliver(entity_id, command, slot, ctx)
                    .await;
            }
        }
    }

    /// Creates the host child and enqueues the first command.
    async fn activate_and_deliver(
        &mut self,
        entity_id: EntityId,
        command: E::Command,
        slot: DeliverySlot<E>,
        ctx: &mut ActorContext<Self>,
    ) {
        match ctx
            .create_child(
                entity_id.as_str(),
                EntityHost::<E>::new(entity_id.clone()),
            )
            .await
        {
            Ok(host) => {
                self.entities.insert(
                    entity_id,
                    EntityEntry::Active {
                        last_active: Instant::now(),
                    },
                );
                let _ = host
                    .tell(EntityRequest::Command { command, slot })
                    .await;
            }
            Err(e) => {
                warn!(
                    "Can't activate entity {} on shard {}: {}",
                    entity_id, self.id, e
                );
                slot.send(Err(DeliveryError::Unavailable(e.to_string())));
            }
        }
    }

    /// Starts passivating one entity: buffer subsequent deliveries and
    /// stop the host off the shard's handler. `EntityStopped` re-enters
    /// the mailbox once the host is fully gone.
    async fn begin_passivation(
        &mut self,
        entity_id: EntityId,
        ctx: &mut ActorContext<Self>,
    ) {
        debug!("Passivating entity {} on shard {}.", entity_id, self.id);
        self.entities.insert(
            entity_id.clone(),
            EntityEntry::Passivating {
                buffer: VecDeque::new(),
            },
        );
        let host = ctx.get_child::<EntityHost<E>>(entity_id.as_str()).await;
        let Some(me) = ctx.reference().await else {
            return;
        };
        tokio::spawn(async move {
            if let Some(host) = host {
                let _ = host.ask(EntityRequest::Passivate).await;
                let _ = host.ask_stop().await;
            }
            let _ = me.tell(ShardCommand::EntityStopped(entity_id)).await;
        });
    }

    /// Handoff: stop accepting deliveries, then flush-stop every host in
    /// turn. Only returns once every host has fully stopped.
    async fn handoff(&mut self, ctx: &mut ActorContext<Self>) {
        debug!("Shard {} handing off.", self.id);
        self.stopping = true;
        let ids: Vec<EntityId> = self.entities.keys().cloned().collect();
        for entity_id in ids {
            if let Some(EntityEntry::Passivating { buffer }) =
                self.entities.remove(&entity_id)
            {
                for (_, slot) in buffer {
                    slot.send(Err(DeliveryError::ShardStopping(self.id)));
                }
            }
            if let Some(host) =
                ctx.get_child::<EntityHost<E>>(entity_id.as_str()).await
            {
                let _ = host.ask(EntityRequest::Passivate).await;
                let _ = host.ask_stop().await;
            }
        }
        self.entities.clear();
    }
}

#[async_trait]
impl<E: Entity> Actor for Shard<E> {
    type Message = ShardCommand<E>;
    type Response = ShardResponse;
    type Event = ();

    async fn pre_start(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        let Some(me) = ctx.reference().await else {
            return Err(ActorError::Start(
                "Can't get shard reference".to_owned(),
            ));
        };
        let cancel = self.cancel.clone();
        let interval = self.config.passivation_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if me.tell(ShardCommand::PassivateIdle).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn post_stop(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        self.cancel.cancel();
        Ok(())
    }
}

#[async_trait]
impl<E: Entity> Handler<Shard<E>> for Shard<E> {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: ShardCommand<E>,
        ctx: &mut ActorContext<Shard<E>>,
    ) -> Result<ShardResponse, ActorError> {
        match msg {
            ShardCommand::Deliver {
                entity_id,
                command,
                slot,
            } => {
                self.deliver(entity_id, command, slot, ctx).await;
                Ok(ShardResponse::Delivered)
            }
            ShardCommand::PassivateIdle => {
                if !self.stopping {
                    let now = Instant::now();
                    let idle: Vec<EntityId> = self
                        .entities
                        .iter()
                        .filter_map(|(id, entry)| match entry {
                            EntityEntry::Active { last_active }
                                if now.duration_since(*last_active)
                                    >= self.config.passivate_after =>
                            {
                                Some(id.clone())
                            }
                            _ => None,
                        })
                        .collect();
                    for entity_id in idle {
                        self.begin_passivation(entity_id, ctx).await;
                    }
                }
                Ok(ShardResponse::None)
            }
            ShardCommand::EntityStopped(entity_id) => {
                if let Some(EntityEntry::Passivating { buffer }) =
                    self.entities.remove(&entity_id)
                {
                    if self.stopping {
                        for (_, slot) in buffer {
                            slot.send(Err(DeliveryError::ShardStopping(
                                self.id,
                            )));
                        }
                    } else {
                        // Redeliver what arrived during the passivation,
                        // in order, to a fresh activation.
                        for (command, slot) in buffer {
                            self.deliver(
                                entity_id.clone(),
                                command,
                                slot,
                                ctx,
                            )
                            .await;
                        }
                    }
                }
                Ok(ShardResponse::None)
            }
            ShardCommand::Handoff => {
                self.handoff(ctx).await;
                Ok(ShardResponse::Stopped)
            }
        }
    }

    async fn on_child_fault(
        &mut self,
        error: ActorError,
        _ctx: &mut ActorContext<Shard<E>>,
    ) -> ChildAction {
        if let ActorError::FailedPermanently(path, reason) = &error {
            let entity_id = EntityId::from(path.key().as_str());
            warn!(
                "Entity {} on shard {} failed permanently: {}",
                entity_id, self.id, reason
            );
            self.entities.insert(entity_id, EntityEntry::Failed);
        }
        ChildAction::Stop
    }
}
