// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Shard region
//!
//! The per-node router and the only entry point callers use. Given an
//! entity id, the region derives the shard, consults its locally cached
//! shard-to-node assignment and either delivers to the local shard child,
//! forwards to the remote owner, or buffers the message while it asks the
//! coordinator for the owner (bounded buffer; overflow fails the send with
//! `RegionBusy`).
//!
//! Remote forwarding runs through one serial pump task per shard, so
//! per-sender delivery order survives rerouting: a pump that observes
//! `NotOwner` or `ShardStopping` hands its queue back to the region, the
//! stale cache entry is invalidated, and the queue is replayed against the
//! freshly resolved owner. Coordinator pushes (`ShardHomeChanged`)
//! invalidate the cache the same way without caller cooperation.
//!

use crate::{
    config::ShardingConfig,
    entity::{DeliverySlot, Entity, EntityId, ReplySlot, ShardId},
    error::DeliveryError,
    hash::shard_for_entity,
    shard::{Shard, ShardCommand, ShardResponse},
    wire::{
        CoordinatorAck, CoordinatorWire, RegionAck, RegionWire,
        coordinator_channel, region_channel,
    },
};

use actor::{
    Actor, ActorContext, ActorPath, ActorRef, Error as ActorError, Handler,
    Message,
};
use cluster::{Frame, MembershipEvent, NodeAddress, NodeId, Transport};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

/// Name of the region root actor for an entity type.
pub fn region_name<E: Entity>() -> String {
    format!("region-{}", E::TYPE)
}

/// Path of the region root actor for an entity type.
pub fn region_path<E: Entity>() -> ActorPath {
    ActorPath::from("/user") / region_name::<E>().as_str()
}

/// A delivery travelling through the region.
#[derive(Debug, Clone)]
pub struct PendingDelivery<E: Entity> {
    pub entity_id: EntityId,
    pub command: E::Command,
    pub slot: DeliverySlot<E>,
}

/// Commands accepted by a shard region.
#[derive(Debug, Clone)]
pub enum RegionCommand<E: Entity> {
    /// Route a command from a local caller.
    Route {
        entity_id: EntityId,
        command: E::Command,
        slot: DeliverySlot<E>,
    },
    /// A delivery received from a peer region. Never forwarded again: if
    /// this node does not own the shard the reply is `NotOwner`.
    Ingress {
        entity_id: EntityId,
        command: E::Command,
        slot: DeliverySlot<E>,
    },
    /// Owner resolution for a shard (coordinator reply or push).
    ShardHome { shard: ShardId, owner: NodeId },
    /// A forwarding pump terminated; its unsent queue comes back for
    /// rerouting.
    StaleOwner {
        shard: ShardId,
        pending: Vec<PendingDelivery<E>>,
    },
    /// Coordinator instruction: drain the local shard, acknowledge once
    /// every hosted entity has stopped.
    HandoffShard {
        shard: ShardId,
        slot: ReplySlot<Result<(), DeliveryError>>,
    },
    /// Local shard handoff finished; stop routing to it.
    ReleaseShard { shard: ShardId },
    /// An owner-resolution request failed; retried while messages wait.
    ResolveFailed { shard: ShardId },
    /// Membership bookkeeping (addresses of peers).
    MemberEvent(MembershipEvent),
}

impl<E: Entity> Message for RegionCommand<E> {}

/// Routing state of one shard, as cached by this region.
enum ShardChannel<E: Entity> {
    /// Owner unknown; messages wait for the coordinator's answer.
    Resolving {
        buffer: VecDeque<PendingDelivery<E>>,
        in_flight: bool,
    },
    /// This node owns the shard.
    Local,
    /// A peer owns the shard; a serial pump forwards to it.
    Remote {
        tx: mpsc::UnboundedSender<PendingDelivery<E>>,
        owner: NodeId,
    },
    /// The previous pump is shutting down; messages wait for its queue to
    /// come back so order is preserved.
    Draining {
        buffer: VecDeque<PendingDelivery<E>>,
        next_owner: Option<NodeId>,
    },
}

/// The per-node shard router for one entity type.
pub struct ShardRegion<E: Entity> {
    node: NodeId,
    coordinator: NodeId,
    config: ShardingConfig,
    transport: Arc<dyn Transport>,
    addresses: HashMap<NodeId, NodeAddress>,
    channels: HashMap<ShardId, ShardChannel<E>>,
    /// Messages currently buffered in `Resolving`/`Draining` channels.
    buffered: usize,
}

impl<E: Entity> ShardRegion<E> {
    /// Creates the region of `node`. `known` preloads peer addresses (at
    /// least the node itself); the rest arrive as membership events.
    pub fn new(
        node: NodeId,
        coordinator: NodeId,
        config: ShardingConfig,
        transport: Arc<dyn Transport>,
        known: HashMap<NodeId, NodeAddress>,
    ) -> Self {
        ShardRegion {
            node,
            coordinator,
            config,
            transport,
            addresses: known,
            channels: HashMap::new(),
            buffered: 0,
        }
    }

    /// Buffers a delivery, enforcing the region-wide capacity.
    fn admit(
        &mut self,
        pending: PendingDelivery<E>,
        buffer: &mut VecDeque<PendingDelivery<E>>,
    ) -> bool {
        if self.buffered >= self.config.buffer_capacity {
            pending.slot.send(Err(DeliveryError::RegionBusy));
            false
        } else {
            buffer.push_back(pending);
            self.buffered += 1;
            true
        }
    }

    /// Delivers to the local shard child, creating it on first use.
    async fn deliver_local(
        &mut self,
        shard: ShardId,
        pending: PendingDelivery<E>,
        ctx: &mut ActorContext<Self>,
    ) {
        let name = format!("shard-{}", shard);
        let shard_ref = match ctx.get_child::<Shard<E>>(&name).await {
            Some(shard_ref) => shard_ref,
            None => {
                match ctx
                    .create_child(
                        &name,
                        Shard::<E>::new(shard, self.config.clone()),
                    )
                    .await
                {
                    Ok(shard_ref) => shard_ref,
                    Err(e) => {
                        warn!("Can't create shard {}: {}", shard, e);
                        pending.slot.send(Err(DeliveryError::Unavailable(
                            e.to_string(),
                        )));
                        return;
                    }
                }
            }
        };
        let _ = shard_ref
            .tell(ShardCommand::Deliver {
                entity_id: pending.entity_id,
                command: pending.command,
                slot: pending.slot,
            })
            .await;
    }

    /// Routes one delivery according to the cached shard state.
    async fn route(
        &mut self,
        pending: PendingDelivery<E>,
        ctx: &mut ActorContext<Self>,
    ) {
        let shard =
            shard_for_entity(&pending.entity_id, self.config.shard_count);
        match self.channels.remove(&shard) {
            Some(ShardChannel::Local) => {
                self.channels.insert(shard, ShardChannel::Local);
                self.deliver_local(shard, pending, ctx).await;
            }
            Some(ShardChannel::Remote { tx, owner }) => match tx.send(pending)
            {
                Ok(_) => {
                    self.channels
                        .insert(shard, ShardChannel::Remote { tx, owner });
                }
                Err(returned) => {
                    // The pump just died; its queue is on the way back.
                    let mut buffer = VecDeque::new();
                    self.admit(returned.0, &mut buffer);
                    self.channels.insert(
                        shard,
                        ShardChannel::Draining {
                            buffer,
                            next_owner: None,
                        },
                    );
                }
            },
            Some(ShardChannel::Resolving {
                mut buffer,
                in_flight,
            }) => {
                self.admit(pending, &mut buffer);
                if !in_flight {
                    self.spawn_resolve(shard, None, ctx).await;
                }
                self.channels.insert(
                    shard,
                    ShardChannel::Resolving {
                        buffer,
                        in_flight: true,
                    },
                );
            }
            Some(ShardChannel::Draining {
                mut buffer,
                next_owner,
            }) => {
                self.admit(pending, &mut buffer);
                self.channels.insert(
                    shard,
                    ShardChannel::Draining { buffer, next_owner },
                );
            }
            None => {
                let mut buffer = VecDeque::new();
                if self.admit(pending, &mut buffer) {
                    self.channels.insert(
                        shard,
                        ShardChannel::Resolving {
                            buffer,
                            in_flight: true,
                        },
                    );
                    self.spawn_resolve(shard, None, ctx).await;
                }
            }
        }
    }

    /// Asks the coordinator who owns `shard`, off the handler. The answer
    /// re-enters the mailbox as `ShardHome`; a failure as `ResolveFailed`.
    async fn spawn_resolve(
        &self,
        shard: ShardId,
        delay: Option<Duration>,
        ctx: &mut ActorContext<Self>,
    ) {
        let Some(me) = ctx.reference().await else {
            return;
        };
        let address = self.addresses.get(&self.coordinator).cloned();
        let transport = self.transport.clone();
        let requester = self.node.clone();
        let budget = self.config.allocation_timeout;
        let retry = self.config.allocation_retry_interval;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let Some(address) = address else {
                // Coordinator address unknown (membership still
                // converging): come back later.
                tokio::time::sleep(retry).await;
                let _ = me.tell(RegionCommand::ResolveFailed { shard }).await;
                return;
            };
            let wire = CoordinatorWire::Allocate { shard, requester };
            let Ok(payload) = bincode::serialize(&wire) else {
                return;
            };
            let request = transport.request(
                &address,
                Frame::new(coordinator_channel(E::TYPE), payload),
            );
            let ack = match tokio::time::timeout(budget, request).await {
                Ok(Ok(bytes)) => {
                    bincode::deserialize::<CoordinatorAck>(&bytes).ok()
                }
                _ => None,
            };
            match ack {
                Some(CoordinatorAck::Allocated { shard, owner }) => {
                    let _ = me
                        .tell(RegionCommand::ShardHome { shard, owner })
                        .await;
                }
                _ => {
                    let _ =
                        me.tell(RegionCommand::ResolveFailed { shard }).await;
                }
            }
        });
    }

    /// Starts the serial forwarding pump towards `owner` and feeds it the
    /// backlog. Returns the backlog untouched if the owner's address is
    /// not known yet.
    async fn start_remote(
        &mut self,
        shard: ShardId,
        owner: NodeId,
        backlog: VecDeque<PendingDelivery<E>>,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), VecDeque<PendingDelivery<E>>> {
        let Some(address) = self.addresses.get(&owner).cloned() else {
            return Err(backlog);
        };
        let Some(me) = ctx.reference().await else {
            return Err(backlog);
        };
        let (tx, rx) = mpsc::unbounded_channel();
        self.buffered = self.buffered.saturating_sub(backlog.len());
        for pending in backlog {
            let _ = tx.send(pending);
        }
        spawn_pump::<E>(
            shard,
            address,
            self.transport.clone(),
            self.config.ask_timeout,
            me,
            rx,
        );
        self.channels
            .insert(shard, ShardChannel::Remote { tx, owner });
        Ok(())
    }

    /// Applies a resolved owner to a shard channel, replaying any backlog
    /// in order.
    async fn shard_home(
        &mut self,
        shard: ShardId,
        owner: NodeId,
        ctx: &mut ActorContext<Self>,
    ) {
        debug!("Shard {} of {} now lives on {}.", shard, E::TYPE, owner);
        let backlog: VecDeque<PendingDelivery<E>> =
            match self.channels.remove(&shard) {
                Some(ShardChannel::Resolving { buffer, .. }) => buffer,
                Some(ShardChannel::Draining { buffer, .. }) => {
                    // The old pump has not returned its queue yet; stash
                    // the new owner until it does.
                    self.channels.insert(
                        shard,
                        ShardChannel::Draining {
                            buffer,
                            next_owner: Some(owner),
                        },
                    );
                    return;
                }
                Some(ShardChannel::Remote { tx, owner: old }) => {
                    if old == owner {
                        self.channels.insert(
                            shard,
                            ShardChannel::Remote { tx, owner: old },
                        );
                        return;
                    }
                    // Dropping the sender ends the pump; its queue comes
                    // back as `StaleOwner` and is rerouted then.
                    self.channels.insert(
                        shard,
                        ShardChannel::Draining {
                            buffer: VecDeque::new(),
                            next_owner: Some(owner),
                        },
                    );
                    return;
                }
                Some(ShardChannel::Local) => {
                    if owner == self.node {
                        self.channels.insert(shard, ShardChannel::Local);
                        return;
                    }
                    // The shard moved away without a graceful handoff
                    // (forced release). Stop hosting it.
                    warn!(
                        "Shard {} of {} was reassigned away; dropping \
                         local hosting.",
                        shard, E::TYPE
                    );
                    let name = format!("shard-{}", shard);
                    if let Some(shard_ref) =
                        ctx.get_child::<Shard<E>>(&name).await
                    {
                        tokio::spawn(async move {
                            let _ =
                                shard_ref.ask(ShardCommand::Handoff).await;
                            let _ = shard_ref.ask_stop().await;
                        });
                    }
                    VecDeque::new()
                }
                None => VecDeque::new(),
            };

        if owner == self.node {
            self.channels.insert(shard, ShardChannel::Local);
            self.buffered = self.buffered.saturating_sub(backlog.len());
            for pending in backlog {
                self.deliver_local(shard, pending, ctx).await;
            }
        } else if let Err(backlog) =
            self.start_remote(shard, owner, backlog, ctx).await
        {
            // Owner address not known yet: hold the backlog and retry.
            self.channels.insert(
                shard,
                ShardChannel::Resolving {
                    buffer: backlog,
                    in_flight: true,
                },
            );
            self.spawn_resolve(
                shard,
                Some(self.config.allocation_retry_interval),
                ctx,
            )
            .await;
        }
    }

    /// Reroutes a dead pump's queue.
    async fn stale_owner(
        &mut self,
        shard: ShardId,
        pending: Vec<PendingDelivery<E>>,
        ctx: &mut ActorContext<Self>,
    ) {
        let mut queue: VecDeque<PendingDelivery<E>> = pending.into();
        self.buffered += queue.len();
        match self.channels.remove(&shard) {
            Some(ShardChannel::Draining { buffer, next_owner }) => {
                queue.extend(buffer);
                match next_owner {
                    Some(owner) if owner == self.node => {
                        self.channels.insert(shard, ShardChannel::Local);
                        self.buffered =
                            self.buffered.saturating_sub(queue.len());
                        for pending in queue {
                            self.deliver_local(shard, pending, ctx).await;
                        }
                    }
                    Some(owner) => {
                        if let Err(queue) = self
                            .start_remote(shard, owner, queue, ctx)
                            .await
                        {
                            self.to_resolving(shard, queue, ctx).await;
                        }
                    }
                    None => self.to_resolving(shard, queue, ctx).await,
                }
            }
            Some(ShardChannel::Remote { .. }) | None => {
                self.to_resolving(shard, queue, ctx).await;
            }
            Some(ShardChannel::Local) => {
                self.channels.insert(shard, ShardChannel::Local);
                self.buffered = self.buffered.saturating_sub(queue.len());
                for pending in queue {
                    self.deliver_local(shard, pending, ctx).await;
                }
            }
            Some(ShardChannel::Resolving { buffer, in_flight }) => {
                queue.extend(buffer);
                self.channels.insert(
                    shard,
                    ShardChannel::Resolving {
                        buffer: queue,
                        in_flight,
                    },
                );
                if !in_flight {
                    self.mark_resolving(shard, ctx).await;
                }
            }
        }
    }

    /// Puts a shard into `Resolving` with the given backlog and asks the
    /// coordinator.
    async fn to_resolving(
        &mut self,
        shard: ShardId,
        buffer: VecDeque<PendingDelivery<E>>,
        ctx: &mut ActorContext<Self>,
    ) {
        self.channels.insert(
            shard,
            ShardChannel::Resolving {
                buffer,
                in_flight: true,
            },
        );
        self.spawn_resolve(shard, None, ctx).await;
    }

    /// Flips an existing `Resolving` channel to in-flight and resolves.
    async fn mark_resolving(
        &mut self,
        shard: ShardId,
        ctx: &mut ActorContext<Self>,
    ) {
        if let Some(ShardChannel::Resolving { in_flight, .. }) =
            self.channels.get_mut(&shard)
        {
            *in_flight = true;
        }
        self.spawn_resolve(shard, None, ctx).await;
    }
}

/// Spawns the serial forwarding pump of one shard. The pump owns its queue
/// and forwards strictly one delivery at a time, so the order the region
/// enqueued is the order the owner observes. On a stale-owner ack or a
/// transport failure it stops and hands every unresolved delivery back to
/// the region.
fn spawn_pump<E: Entity>(
    shard: ShardId,
    address: NodeAddress,
    transport: Arc<dyn Transport>,
    ask_timeout: Duration,
    region: ActorRef<ShardRegion<E>>,
    mut rx: mpsc::UnboundedReceiver<PendingDelivery<E>>,
) {
    tokio::spawn(async move {
        let channel = region_channel(E::TYPE);
        let mut leftover: Vec<PendingDelivery<E>> = Vec::new();
        while let Some(pending) = rx.recv().await {
            let Ok(command) = bincode::serialize(&pending.command) else {
                pending.slot.send(Err(DeliveryError::Unavailable(
                    "can't encode command".to_owned(),
                )));
                continue;
            };
            let wire = RegionWire::Route {
                entity_id: pending.entity_id.clone(),
                shard,
                command,
            };
            let Ok(payload) = bincode::serialize(&wire) else {
                pending.slot.send(Err(DeliveryError::Unavailable(
                    "can't encode envelope".to_owned(),
                )));
                continue;
            };
            let request = transport
                .request(&address, Frame::new(channel.clone(), payload));
            let ack = match tokio::time::timeout(ask_timeout, request).await {
                Ok(Ok(bytes)) => {
                    bincode::deserialize::<RegionAck>(&bytes).ok()
                }
                _ => None,
            };
            match ack {
                Some(RegionAck::Outcome(bytes)) => {
                    match bincode::deserialize::<E::Outcome>(&bytes) {
                        Ok(outcome) => pending.slot.send(Ok(outcome)),
                        Err(_) => {
                            pending.slot.send(Err(
                                DeliveryError::Unavailable(
                                    "can't decode outcome".to_owned(),
                                ),
                            ));
                        }
                    }
                }
                Some(RegionAck::Error(
                    error @ (DeliveryError::ShardStopping(_)
                    | DeliveryError::NotOwner(_)),
                )) => {
                    debug!(
                        "Pump for shard {} of {} hit {}; rerouting.",
                        shard,
                        E::TYPE,
                        error
                    );
                    leftover.push(pending);
                    break;
                }
                Some(RegionAck::Error(error)) => {
                    pending.slot.send(Err(error));
                }
                Some(RegionAck::Ack) | None => {
                    // Transport failure or nonsense ack: retry against a
                    // freshly resolved owner.
                    leftover.push(pending);
                    break;
                }
            }
        }
        rx.close();
        while let Ok(pending) = rx.try_recv() {
            leftover.push(pending);
        }
        let _ = region
            .tell(RegionCommand::StaleOwner {
                shard,
                pending: leftover,
            })
            .await;
    });
}

#[async_trait]
impl<E: Entity> Actor for ShardRegion<E> {
    type Message = RegionCommand<E>;
    type Response = ();
    type Event = ();
}

#[async_trait]
impl<E: Entity> Handler<ShardRegion<E>> for ShardRegion<E> {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: RegionCommand<E>,
        ctx: &mut ActorContext<ShardRegion<E>>,
    ) -> Result<(), ActorError> {
        match msg {
            RegionCommand::Route {
                entity_id,
                command,
                slot,
            } => {
                self.route(
                    PendingDelivery {
                        entity_id,
                        command,
                        slot,
                    },
                    ctx,
                )
                .await;
            }
            RegionCommand::Ingress {
                entity_id,
                command,
                slot,
            } => {
                let shard =
                    shard_for_entity(&entity_id, self.config.shard_count);
                let is_local = matches!(
                    self.channels.get(&shard),
                    Some(ShardChannel::Local)
                );
                if is_local {
                    self.deliver_local(
                        shard,
                        PendingDelivery {
                            entity_id,
                            command,
                            slot,
                        },
                        ctx,
                    )
                    .await;
                } else {
                    slot.send(Err(DeliveryError::NotOwner(shard)));
                }
            }
            RegionCommand::ShardHome { shard, owner } => {
                self.shard_home(shard, owner, ctx).await;
            }
            RegionCommand::StaleOwner { shard, pending } => {
                self.stale_owner(shard, pending, ctx).await;
            }
            RegionCommand::HandoffShard { shard, slot } => {
                let is_local = matches!(
                    self.channels.get(&shard),
                    Some(ShardChannel::Local)
                );
                match is_local {
                    true => {
                        // Stop routing new deliveries into the stopping
                        // shard; they wait for the next owner.
                        self.channels.insert(
                            shard,
                            ShardChannel::Resolving {
                                buffer: VecDeque::new(),
                                in_flight: true,
                            },
                        );
                        let name = format!("shard-{}", shard);
                        let shard_ref =
                            ctx.get_child::<Shard<E>>(&name).await;
                        let me = ctx.reference().await;
                        let budget = self.config.handoff_timeout;
                        tokio::spawn(async move {
                            if let Some(shard_ref) = shard_ref {
                                let drain = tokio::time::timeout(
                                    budget,
                                    shard_ref.ask(ShardCommand::Handoff),
                                )
                                .await;
                                match drain {
                                    Ok(Ok(ShardResponse::Stopped)) => {
                                        slot.send(Ok(()));
                                    }
                                    _ => {
                                        // Stuck drain: report failure but
                                        // stop hosting regardless.
                                        slot.send(Err(
                                            DeliveryError::Unavailable(
                                                "handoff failed".to_owned(),
                                            ),
                                        ));
                                    }
                                }
                                let _ = shard_ref.ask_stop().await;
                            } else {
                                slot.send(Ok(()));
                            }
                            if let Some(me) = me {
                                let _ = me
                                    .tell(RegionCommand::ReleaseShard {
                                        shard,
                                    })
                                    .await;
                            }
                        });
                    }
                    false => {
                        // Not hosting the shard: handoff is idempotent.
                        slot.send(Ok(()));
                    }
                }
            }
            RegionCommand::ReleaseShard { shard } => {
                let backlog = match self.channels.get(&shard) {
                    Some(ShardChannel::Resolving { buffer, .. }) => {
                        Some(!buffer.is_empty())
                    }
                    _ => None,
                };
                match backlog {
                    Some(false) => {
                        self.channels.remove(&shard);
                    }
                    Some(true) => {
                        // Re-resolve: the coordinator has (or will have)
                        // a new owner for the buffered messages.
                        self.mark_resolving(shard, ctx).await;
                    }
                    None => {}
                }
            }
            RegionCommand::ResolveFailed { shard } => {
                let retry = self.config.allocation_retry_interval;
                let backlog = match self.channels.get(&shard) {
                    Some(ShardChannel::Resolving { buffer, .. }) => {
                        Some(!buffer.is_empty())
                    }
                    _ => None,
                };
                match backlog {
                    Some(false) => {
                        self.channels.remove(&shard);
                    }
                    Some(true) => {
                        if let Some(ShardChannel::Resolving {
                            in_flight,
                            ..
                        }) = self.channels.get_mut(&shard)
                        {
                            *in_flight = true;
                        }
                        self.spawn_resolve(shard, Some(retry), ctx).await;
                    }
                    None => {}
                }
            }
            RegionCommand::MemberEvent(event) => match event {
                MembershipEvent::MemberJoined(m)
                | MembershipEvent::MemberUp(m)
                | MembershipEvent::MemberLeaving(m)
                | MembershipEvent::MemberReachable(m)
                | MembershipEvent::MemberUnreachable(m) => {
                    self.addresses.insert(m.id, m.address);
                }
                MembershipEvent::MemberExited(m)
                | MembershipEvent::MemberDown(m) => {
                    self.addresses.remove(&m.id);
                }
            },
        }
        Ok(())
    }
}
