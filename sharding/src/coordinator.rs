// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Shard coordinator
//!
//! Cluster-wide singleton owning the authoritative shard-to-node
//! assignment table of one entity type. Regions hold read-only caches of
//! it; every change goes through this actor and is journaled before it is
//! acknowledged, so a restarted coordinator recovers the table it last
//! confirmed.
//!
//! Allocation picks the least-loaded available node (ties to the lowest
//! node id). Membership changes drive reassignment: a leaving node's
//! shards are moved through graceful handoffs, a dead node's shards are
//! reassigned directly, and a node that stays unreachable past the grace
//! period is treated as dead for reassignment purposes without touching
//! its membership identity. At most `max_concurrent_handoffs` shards move
//! at once, and a shard only becomes assignable again once its handoff
//! acknowledgement (or the hard timeout) has been observed — the window in
//! which two nodes could host the same shard stays closed.
//!

use crate::{
    config::ShardingConfig,
    entity::{ReplySlot, ShardId},
    error::DeliveryError,
    wire::{
        CoordinatorAck, CoordinatorWire, RegionAck, RegionWire,
        region_channel,
    },
};

use actor::{
    Actor, ActorContext, ActorPath, ActorRef, Error as ActorError, Event,
    Handler, Message, Response,
};
use cluster::{
    Error as ClusterError, Frame, FrameHandler, MemberStatus,
    MembershipEvent, NodeAddress, NodeId, Transport,
};
use store::PersistentActor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};

/// Reply slot of an allocation request.
pub type AllocationSlot = ReplySlot<Result<NodeId, DeliveryError>>;

/// Lifecycle of the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Recovering the assignment table.
    #[default]
    Initializing,
    /// Serving allocations; no shard is moving.
    Active,
    /// One or more shards are being moved.
    Rebalancing,
}

/// What the coordinator knows about a member.
#[derive(Debug, Clone)]
struct MemberInfo {
    address: NodeAddress,
    status: MemberStatus,
}

/// Journal entries of the assignment table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoordinatorEvent {
    Assigned { shard: ShardId, node: NodeId },
    Released { shard: ShardId },
}

impl Event for CoordinatorEvent {}

/// Commands accepted by the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorCommand {
    /// Who owns this shard? Assign it if nobody does.
    Allocate {
        shard: ShardId,
        requester: NodeId,
        slot: AllocationSlot,
    },
    /// Membership change observed by the local gossiper.
    MemberEvent(MembershipEvent),
    /// The downing grace period of an unreachable node elapsed.
    UnreachableExpired(NodeId),
    /// A handoff finished (or timed out, `success = false`).
    HandoffOutcome {
        shard: ShardId,
        from: NodeId,
        success: bool,
    },
    /// Read the assignment table.
    GetAssignments,
}

impl Message for CoordinatorCommand {}

/// Responses of the coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorResponse {
    None,
    Assignments(BTreeMap<ShardId, NodeId>),
}

impl Response for CoordinatorResponse {}

/// The coordinator actor of one entity type.
#[derive(Clone, Serialize, Deserialize)]
pub struct ShardCoordinator {
    entity_type: String,
    /// The authoritative assignment table; the only persisted state.
    assignments: BTreeMap<ShardId, NodeId>,
    #[serde(skip)]
    phase: CoordinatorState,
    #[serde(skip)]
    members: BTreeMap<NodeId, MemberInfo>,
    #[serde(skip)]
    unreachable: BTreeSet<NodeId>,
    #[serde(skip)]
    inflight: BTreeSet<ShardId>,
    #[serde(skip)]
    queue: VecDeque<ShardId>,
    #[serde(skip)]
    pending: HashMap<ShardId, Vec<AllocationSlot>>,
    #[serde(skip)]
    config: ShardingConfig,
    #[serde(skip)]
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for ShardCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardCoordinator")
            .field("entity_type", &self.entity_type)
            .field("phase", &self.phase)
            .field("assignments", &self.assignments)
            .field("inflight", &self.inflight)
            .finish()
    }
}

impl ShardCoordinator {
    pub fn new(
        entity_type: &str,
        config: ShardingConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        ShardCoordinator {
            entity_type: entity_type.to_owned(),
            assignments: BTreeMap::new(),
            phase: CoordinatorState::Initializing,
            members: BTreeMap::new(),
            unreachable: BTreeSet::new(),
            inflight: BTreeSet::new(),
            queue: VecDeque::new(),
            pending: HashMap::new(),
            config,
            transport: Some(transport),
        }
    }

    /// A node can receive shards while it is joining or up and reachable.
    fn node_available(&self, node: &NodeId) -> bool {
        !self.unreachable.contains(node)
            && self
                .members
                .get(node)
                .map(|info| {
                    matches!(
                        info.status,
                        MemberStatus::Joining | MemberStatus::Up
                    )
                })
                .unwrap_or(false)
    }

    /// Least-loaded available node, ties to the lowest node id.
    fn select_owner(&self, exclude: Option<&NodeId>) -> Option<NodeId> {
        let mut best: Option<(usize, &NodeId)> = None;
        for node in self.members.keys() {
            if Some(node) == exclude || !self.node_available(node) {
                continue;
            }
            let load = self
                .assignments
                .values()
                .filter(|owner| *owner == node)
                .count();
            // Strictly-less keeps the lowest node id on ties, since the
            // member map iterates in id order.
            if best.map(|(l, _)| load < l).unwrap_or(true) {
                best = Some((load, node));
            }
        }
        best.map(|(_, node)| node.clone())
    }

    /// Shards currently assigned to a node.
    fn owned_by(&self, node: &NodeId) -> Vec<ShardId> {
        self.assignments
            .iter()
            .filter(|(_, owner)| *owner == node)
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Answers every allocation request parked on a shard.
    fn drain_pending(
        &mut self,
        shard: ShardId,
        result: Result<NodeId, DeliveryError>,
    ) {
        if let Some(slots) = self.pending.remove(&shard) {
            for slot in slots {
                slot.send(result.clone());
            }
        }
    }

    /// Pushes the new shard home to every member's region so stale caches
    /// are invalidated without caller cooperation.
    fn broadcast_home(&self, shard: ShardId, owner: NodeId) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let channel = region_channel(&self.entity_type);
        let wire = RegionWire::ShardHomeChanged {
            shard,
            owner: owner.clone(),
        };
        let Ok(payload) = bincode::serialize(&wire) else {
            return;
        };
        for info in self.members.values() {
            let transport = transport.clone();
            let address = info.address.clone();
            let channel = channel.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = transport
                    .request(&address, Frame::new(channel, payload))
                    .await;
            });
        }
    }

    /// Journals a release and a fresh assignment, then tells the world.
    async fn reassign(
        &mut self,
        shard: ShardId,
        exclude: Option<&NodeId>,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        if self.assignments.contains_key(&shard) {
            self.persist(&CoordinatorEvent::Released { shard }, ctx)
                .await?;
        }
        let target = self
            .select_owner(exclude)
            .or_else(|| self.select_owner(None));
        match target {
            Some(node) => {
                self.persist(
                    &CoordinatorEvent::Assigned {
                        shard,
                        node: node.clone(),
                    },
                    ctx,
                )
                .await?;
                debug!(
                    "Shard {} of {} reassigned to {}.",
                    shard, self.entity_type, node
                );
                self.drain_pending(shard, Ok(node.clone()));
                self.broadcast_home(shard, node);
            }
            None => {
                warn!(
                    "No node available for shard {} of {}.",
                    shard, self.entity_type
                );
                self.drain_pending(
                    shard,
                    Err(DeliveryError::Unavailable(
                        "no node available".to_owned(),
                    )),
                );
            }
        }
        Ok(())
    }

    /// Reassigns every shard of a node that is gone (or past its grace
    /// period), without handoff: there is nobody left to drain.
    async fn reassign_orphans(
        &mut self,
        node: &NodeId,
        ctx: &mut ActorContext<Self>,
    ) {
        for shard in self.owned_by(node) {
            self.inflight.remove(&shard);
            if let Err(e) = self.reassign(shard, Some(node), ctx).await {
                error!(
                    "Can't reassign orphaned shard {} of {}: {}",
                    shard, self.entity_type, e
                );
            }
        }
    }

    /// Queues every shard of an over-loaded node beyond its fair share.
    fn plan_rebalance(&mut self) {
        let candidates: Vec<&NodeId> = self
            .members
            .keys()
            .filter(|node| self.node_available(node))
            .collect();
        if candidates.is_empty() {
            return;
        }
        let fair_share = self.assignments.len().div_ceil(candidates.len());
        let mut moves = Vec::new();
        for node in candidates {
            let owned = self.owned_by(node);
            if owned.len() > fair_share {
                moves.extend(
                    owned.into_iter().skip(fair_share).filter(|shard| {
                        !self.inflight.contains(shard)
                            && !self.queue.contains(shard)
                    }),
                );
            }
        }
        if !moves.is_empty() {
            debug!(
                "Rebalancing {} shards of {}.",
                moves.len(),
                self.entity_type
            );
            self.queue.extend(moves);
        }
    }

    /// Starts queued handoffs up to the concurrency limit. A shard in
    /// flight is not assignable until its outcome is observed.
    async fn pump_handoffs(&mut self, ctx: &mut ActorContext<Self>) {
        while self.inflight.len() < self.config.max_concurrent_handoffs {
            let Some(shard) = self.queue.pop_front() else {
                break;
            };
            let Some(owner) = self.assignments.get(&shard).cloned() else {
                continue;
            };
            // A reachable owner gets the chance to drain, whatever its
            // lifecycle state; an unreachable or unknown one does not.
            let reachable = !self.unreachable.contains(&owner)
                && self.members.contains_key(&owner);
            if !reachable {
                if let Err(e) = self.reassign(shard, Some(&owner), ctx).await
                {
                    error!("Can't reassign shard {}: {}", shard, e);
                }
                continue;
            }
            let Some(address) =
                self.members.get(&owner).map(|info| info.address.clone())
            else {
                continue;
            };
            self.inflight.insert(shard);
            self.phase = CoordinatorState::Rebalancing;
            self.spawn_handoff(shard, owner, address, ctx).await;
        }
        if self.inflight.is_empty() && self.queue.is_empty() {
            self.phase = CoordinatorState::Active;
        }
    }

    /// Sends the handoff instruction off the handler; the outcome
    /// re-enters the mailbox.
    async fn spawn_handoff(
        &self,
        shard: ShardId,
        owner: NodeId,
        address: NodeAddress,
        ctx: &mut ActorContext<Self>,
    ) {
        let Some(me) = ctx.reference().await else {
            return;
        };
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let channel = region_channel(&self.entity_type);
        let budget = self.config.handoff_timeout;
        tokio::spawn(async move {
            let wire = RegionWire::Handoff { shard };
            let Ok(payload) = bincode::serialize(&wire) else {
                return;
            };
            let request =
                transport.request(&address, Frame::new(channel, payload));
            let success =
                match tokio::time::timeout(budget, request).await {
                    Ok(Ok(bytes)) => matches!(
                        bincode::deserialize::<RegionAck>(&bytes),
                        Ok(RegionAck::Ack)
                    ),
                    _ => false,
                };
            let _ = me
                .tell(CoordinatorCommand::HandoffOutcome {
                    shard,
                    from: owner,
                    success,
                })
                .await;
        });
    }

    /// Handles one membership transition.
    async fn on_member_event(
        &mut self,
        event: MembershipEvent,
        ctx: &mut ActorContext<Self>,
    ) {
        match event {
            MembershipEvent::MemberJoined(m) => {
                self.members.insert(
                    m.id.clone(),
                    MemberInfo {
                        address: m.address,
                        status: m.status,
                    },
                );
            }
            MembershipEvent::MemberUp(m) => {
                let newly_up = self
                    .members
                    .get(&m.id)
                    .map(|info| info.status != MemberStatus::Up)
                    .unwrap_or(true);
                self.members.insert(
                    m.id.clone(),
                    MemberInfo {
                        address: m.address,
                        status: MemberStatus::Up,
                    },
                );
                if newly_up {
                    self.plan_rebalance();
                    self.pump_handoffs(ctx).await;
                }
            }
            MembershipEvent::MemberLeaving(m) => {
                if let Some(info) = self.members.get_mut(&m.id) {
                    info.status = MemberStatus::Leaving;
                }
                // Graceful exit: move everything it owns while it can
                // still drain.
                let owned = self.owned_by(&m.id);
                debug!(
                    "Node {} leaving; moving {} shards of {}.",
                    m.id,
                    owned.len(),
                    self.entity_type
                );
                let to_queue: Vec<_> = owned
                    .into_iter()
                    .filter(|shard| {
                        !self.inflight.contains(shard)
                            && !self.queue.contains(shard)
                    })
                    .collect();
                self.queue.extend(to_queue);
                self.pump_handoffs(ctx).await;
            }
            MembershipEvent::MemberExited(m) => {
                if let Some(info) = self.members.get_mut(&m.id) {
                    info.status = MemberStatus::Exiting;
                }
                // The node may still be alive and draining: prefer a
                // handoff, falling back to force-release on timeout.
                let owned = self.owned_by(&m.id);
                let to_queue: Vec<_> = owned
                    .into_iter()
                    .filter(|shard| {
                        !self.inflight.contains(shard)
                            && !self.queue.contains(shard)
                    })
                    .collect();
                self.queue.extend(to_queue);
                self.pump_handoffs(ctx).await;
            }
            MembershipEvent::MemberDown(m) => {
                if let Some(info) = self.members.get_mut(&m.id) {
                    info.status = MemberStatus::Down;
                }
                self.unreachable.remove(&m.id);
                self.reassign_orphans(&m.id.clone(), ctx).await;
            }
            MembershipEvent::MemberUnreachable(m) => {
                self.unreachable.insert(m.id.clone());
                let Some(me) = ctx.reference().await else {
                    return;
                };
                let grace = self.config.downing_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = me
                        .tell(CoordinatorCommand::UnreachableExpired(m.id))
                        .await;
                });
            }
            MembershipEvent::MemberReachable(m) => {
                self.unreachable.remove(&m.id);
            }
        }
    }
}

#[async_trait]
impl Actor for ShardCoordinator {
    type Message = CoordinatorCommand;
    type Response = CoordinatorResponse;
    type Event = CoordinatorEvent;

    async fn pre_start(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        // Recover the table journaled by previous incarnations.
        let prefix = self.entity_type.clone();
        self.start_store("coordinator", Some(prefix), ctx).await?;
        self.phase = CoordinatorState::Active;
        debug!(
            "Coordinator for {} active with {} assignments.",
            self.entity_type,
            self.assignments.len()
        );
        Ok(())
    }

    async fn pre_stop(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        self.stop_store(ctx).await
    }
}

#[async_trait]
impl PersistentActor for ShardCoordinator {
    fn apply(&mut self, event: &CoordinatorEvent) {
        match event {
            CoordinatorEvent::Assigned { shard, node } => {
                self.assignments.insert(*shard, node.clone());
            }
            CoordinatorEvent::Released { shard } => {
                self.assignments.remove(shard);
            }
        }
    }

    fn update(&mut self, state: Self) {
        // Only the assignment table is durable; the runtime bookkeeping
        // of this incarnation stays.
        self.assignments = state.assignments;
    }
}

#[async_trait]
impl Handler<ShardCoordinator> for ShardCoordinator {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: CoordinatorCommand,
        ctx: &mut ActorContext<ShardCoordinator>,
    ) -> Result<CoordinatorResponse, ActorError> {
        match msg {
            CoordinatorCommand::Allocate {
                shard,
                requester,
                slot,
            } => {
                debug!(
                    "Allocation request for shard {} of {} from {}.",
                    shard, self.entity_type, requester
                );
                if self.inflight.contains(&shard)
                    || self.queue.contains(&shard)
                {
                    // The shard is moving; answer once it settles.
                    self.pending.entry(shard).or_default().push(slot);
                    return Ok(CoordinatorResponse::None);
                }
                if let Some(owner) = self.assignments.get(&shard).cloned() {
                    if self.node_available(&owner) {
                        slot.send(Ok(owner));
                        return Ok(CoordinatorResponse::None);
                    }
                    // Owner is gone: fall through to a fresh assignment.
                }
                self.pending.entry(shard).or_default().push(slot);
                if let Err(e) = self.reassign(shard, None, ctx).await {
                    error!("Can't assign shard {}: {}", shard, e);
                    self.drain_pending(
                        shard,
                        Err(DeliveryError::Unavailable(e.to_string())),
                    );
                }
                Ok(CoordinatorResponse::None)
            }
            CoordinatorCommand::MemberEvent(event) => {
                self.on_member_event(event, ctx).await;
                Ok(CoordinatorResponse::None)
            }
            CoordinatorCommand::UnreachableExpired(node) => {
                if self.unreachable.contains(&node) {
                    warn!(
                        "Node {} unreachable past the grace period; \
                         reassigning its shards.",
                        node
                    );
                    self.reassign_orphans(&node, ctx).await;
                }
                Ok(CoordinatorResponse::None)
            }
            CoordinatorCommand::HandoffOutcome {
                shard,
                from,
                success,
            } => {
                self.inflight.remove(&shard);
                if !success {
                    // Hard timeout: force-release the shard, accepting
                    // state loss for its entities.
                    warn!(
                        "Handoff of shard {} of {} from {} did not \
                         complete; force-releasing.",
                        shard, self.entity_type, from
                    );
                }
                // Only reassign if the table still points at the drained
                // node; the shard may already have moved through another
                // path (orphan reassignment racing the handoff).
                if self.assignments.get(&shard) == Some(&from) {
                    if let Err(e) =
                        self.reassign(shard, Some(&from), ctx).await
                    {
                        error!("Can't reassign shard {}: {}", shard, e);
                    }
                } else if let Some(owner) =
                    self.assignments.get(&shard).cloned()
                {
                    self.drain_pending(shard, Ok(owner));
                }
                self.pump_handoffs(ctx).await;
                Ok(CoordinatorResponse::None)
            }
            CoordinatorCommand::GetAssignments => Ok(
                CoordinatorResponse::Assignments(self.assignments.clone()),
            ),
        }
    }
}

/// Transport endpoint bridging allocation frames into the coordinator's
/// mailbox.
pub struct CoordinatorEndpoint {
    coordinator: ActorRef<ShardCoordinator>,
    timeout: Duration,
}

impl CoordinatorEndpoint {
    pub fn new(
        coordinator: ActorRef<ShardCoordinator>,
        timeout: Duration,
    ) -> Self {
        CoordinatorEndpoint {
            coordinator,
            timeout,
        }
    }
}

#[async_trait]
impl FrameHandler for CoordinatorEndpoint {
    async fn on_frame(
        &self,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, ClusterError> {
        let wire: CoordinatorWire = bincode::deserialize(&payload)
            .map_err(|e| ClusterError::Codec(e.to_string()))?;
        let ack = match wire {
            CoordinatorWire::Allocate { shard, requester } => {
                let (slot, receiver) = ReplySlot::channel();
                if self
                    .coordinator
                    .tell(CoordinatorCommand::Allocate {
                        shard,
                        requester,
                        slot,
                    })
                    .await
                    .is_err()
                {
                    CoordinatorAck::Error(DeliveryError::Unavailable(
                        "coordinator is gone".to_owned(),
                    ))
                } else {
                    match tokio::time::timeout(self.timeout, receiver).await
                    {
                        Ok(Ok(Ok(owner))) => {
                            CoordinatorAck::Allocated { shard, owner }
                        }
                        Ok(Ok(Err(error))) => CoordinatorAck::Error(error),
                        Ok(Err(_closed)) => {
                            CoordinatorAck::Error(DeliveryError::Unavailable(
                                "allocation dropped".to_owned(),
                            ))
                        }
                        Err(_elapsed) => {
                            CoordinatorAck::Error(DeliveryError::Timeout(
                                "allocation not answered in time".to_owned(),
                            ))
                        }
                    }
                }
            }
        };
        bincode::serialize(&ack)
            .map_err(|e| ClusterError::Codec(e.to_string()))
    }
}
