// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Gossiper
//!
//! The per-node membership actor. On every tick it heartbeats its peers,
//! refreshes its own suspicion set from the failure detector, performs
//! leader duties when it is the leader, and exchanges its view with a
//! random subset of peers (push-pull). All network completions re-enter the
//! mailbox as messages, so the view is only ever touched from the actor's
//! own handler.
//!
//! Membership transitions are published as [`MembershipEvent`]s on the
//! actor event bus; the sharding layer subscribes to them.
//!

use crate::{
    config::ClusterConfig,
    detector::FailureDetector,
    error::Error as ClusterError,
    node::{Member, MemberStatus, NodeAddress, NodeId},
    transport::{Frame, FrameHandler, Transport},
    view::{MembershipChange, MembershipView},
};

use actor::{
    Actor, ActorContext, ActorPath, ActorRef, Error as ActorError, Event,
    Handler, Message, Response,
};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use std::{sync::Arc, time::Instant};

/// Transport channel served by the gossip endpoint.
pub const CHANNEL_GOSSIP: &str = "gossip";

/// Membership transitions observed by one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MembershipEvent {
    MemberJoined(Member),
    MemberUp(Member),
    MemberLeaving(Member),
    MemberExited(Member),
    MemberDown(Member),
    MemberUnreachable(Member),
    MemberReachable(Member),
}

impl Event for MembershipEvent {}

/// Gossip payloads carried over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipWire {
    /// Liveness probe; the reply is empty.
    Heartbeat { from: NodeId },
    /// Push-pull view exchange; the reply is the receiver's merged view.
    Exchange { from: NodeId, view: MembershipView },
}

/// Commands accepted by the [`Gossiper`].
#[derive(Debug, Clone)]
pub enum GossipCommand {
    /// Periodic tick, scheduled by the gossiper itself.
    Tick,
    /// A payload received from a peer through the transport.
    Remote(GossipWire),
    /// A view pulled from a peer during an exchange round.
    Merge(MembershipView),
    /// A peer answered a heartbeat.
    Alive(NodeId),
    /// Administrative decision: mark a node as down.
    MarkDown(NodeId),
    /// Start leaving the cluster gracefully.
    Leave,
    /// Read the current view.
    GetView,
}

impl Message for GossipCommand {}

/// Responses of the [`Gossiper`].
#[derive(Debug, Clone)]
pub enum GossipResponse {
    View(MembershipView),
    None,
}

impl Response for GossipResponse {}

/// The membership actor of one node.
pub struct Gossiper {
    myself: Member,
    config: ClusterConfig,
    seeds: Vec<NodeAddress>,
    view: MembershipView,
    detector: FailureDetector,
    transport: Arc<dyn Transport>,
    /// Version of this node's own suspicion set.
    suspicion_version: u64,
    cancel: CancellationToken,
}

impl Gossiper {
    /// Creates the gossiper for `myself`. `seeds` are contact addresses
    /// used while the view still contains no other member.
    pub fn new(
        myself: Member,
        seeds: Vec<NodeAddress>,
        config: ClusterConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let detector = FailureDetector::new(
            config.heartbeat_interval,
            config.missed_heartbeats,
        );
        Gossiper {
            myself,
            config,
            seeds,
            view: MembershipView::new(),
            detector,
            transport,
            suspicion_version: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Applies view changes: keeps the detector and the self record in
    /// sync, and publishes the corresponding membership events.
    async fn publish_changes(
        &mut self,
        changes: Vec<MembershipChange>,
        ctx: &mut ActorContext<Self>,
    ) {
        let now = Instant::now();
        for change in changes {
            let event = match change {
                MembershipChange::Added(member) => {
                    if member.id != self.myself.id {
                        self.detector.watch(&member.id, now);
                    }
                    MembershipEvent::MemberJoined(member)
                }
                MembershipChange::Updated(member) => {
                    if member.id == self.myself.id {
                        self.myself = member.clone();
                    }
                    match member.status {
                        MemberStatus::Joining => {
                            MembershipEvent::MemberJoined(member)
                        }
                        MemberStatus::Up => MembershipEvent::MemberUp(member),
                        MemberStatus::Leaving => {
                            MembershipEvent::MemberLeaving(member)
                        }
                        MemberStatus::Exiting => {
                            self.detector.forget(&member.id);
                            MembershipEvent::MemberExited(member)
                        }
                        MemberStatus::Down => {
                            self.detector.forget(&member.id);
                            MembershipEvent::MemberDown(member)
                        }
                    }
                }
                MembershipChange::ReachabilityChanged { member, reachable } => {
                    if reachable {
                        MembershipEvent::MemberReachable(member)
                    } else {
                        MembershipEvent::MemberUnreachable(member)
                    }
                }
            };
            debug!("Membership event: {:?}", event);
            if let Err(e) = ctx.publish_event(event).await {
                warn!("Can't publish membership event: {}", e);
            }
        }
    }

    /// Refreshes this node's suspicion set from the failure detector.
    async fn refresh_suspicions(&mut self, ctx: &mut ActorContext<Self>) {
        let now = Instant::now();
        let suspects = self.detector.suspects(now);
        let current = self.view.suspicion_version(&self.myself.id);
        let before = self.view.unreachable();
        let changed = {
            let known = suspects
                .into_iter()
                .filter(|id| {
                    self.view
                        .get(id)
                        .map(|m| !m.status.is_terminal())
                        .unwrap_or(false)
                })
                .collect();
            self.suspicion_version = current + 1;
            self.view.set_suspects(
                &self.myself.id,
                self.suspicion_version,
                known,
            )
        };
        if changed {
            let after = self.view.unreachable();
            let mut changes = Vec::new();
            for id in after.difference(&before) {
                if let Some(member) = self.view.get(id) {
                    changes.push(MembershipChange::ReachabilityChanged {
                        member: member.clone(),
                        reachable: false,
                    });
                }
            }
            for id in before.difference(&after) {
                if let Some(member) = self.view.get(id) {
                    changes.push(MembershipChange::ReachabilityChanged {
                        member: member.clone(),
                        reachable: true,
                    });
                }
            }
            self.publish_changes(changes, ctx).await;
        }
    }

    /// Leader duties: promote joining members and move leaving members
    /// towards the exit. Only the leader applies them, and leadership is
    /// deterministic from the converged view.
    async fn leader_duties(&mut self, ctx: &mut ActorContext<Self>) {
        if self.view.leader() != Some(&self.myself.id) {
            return;
        }
        let mut promotions = Vec::new();
        for member in self.view.members() {
            match member.status {
                MemberStatus::Joining => {
                    promotions.push(member.with_status(MemberStatus::Up));
                }
                MemberStatus::Leaving => {
                    promotions.push(member.with_status(MemberStatus::Exiting));
                }
                _ => {}
            }
        }
        let mut changes = Vec::new();
        for member in promotions {
            if let Some(change) = self.view.upsert(member) {
                changes.push(change);
            }
        }
        self.publish_changes(changes, ctx).await;
    }

    /// Targets for heartbeats: every non-terminal peer.
    fn heartbeat_targets(&self) -> Vec<Member> {
        self.view
            .members()
            .filter(|m| m.id != self.myself.id && !m.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Targets for this round's view exchange: a random subset of peers,
    /// falling back to the seed addresses while the view is lonely.
    fn exchange_targets(&self) -> Vec<NodeAddress> {
        let peers: Vec<NodeAddress> = self
            .view
            .members()
            .filter(|m| m.id != self.myself.id && !m.status.is_terminal())
            .map(|m| m.address.clone())
            .collect();
        if peers.is_empty() {
            return self
                .seeds
                .iter()
                .filter(|a| **a != self.myself.address)
                .cloned()
                .collect();
        }
        let mut rng = rand::thread_rng();
        peers
            .choose_multiple(&mut rng, self.config.gossip_fanout)
            .cloned()
            .collect()
    }

    /// Sends heartbeats and view exchanges for one round. Replies re-enter
    /// the mailbox as `Alive`/`Merge` commands.
    fn gossip_round(&self, myself: ActorRef<Gossiper>) {
        let from = self.myself.id.clone();

        for member in self.heartbeat_targets() {
            let transport = self.transport.clone();
            let myself = myself.clone();
            let wire = GossipWire::Heartbeat { from: from.clone() };
            tokio::spawn(async move {
                let Ok(payload) = bincode::serialize(&wire) else {
                    return;
                };
                if transport
                    .request(
                        &member.address,
                        Frame::new(CHANNEL_GOSSIP, payload),
                    )
                    .await
                    .is_ok()
                {
                    let _ =
                        myself.tell(GossipCommand::Alive(member.id)).await;
                }
            });
        }

        for address in self.exchange_targets() {
            let transport = self.transport.clone();
            let myself = myself.clone();
            let wire = GossipWire::Exchange {
                from: from.clone(),
                view: self.view.clone(),
            };
            tokio::spawn(async move {
                let Ok(payload) = bincode::serialize(&wire) else {
                    return;
                };
                match transport
                    .request(&address, Frame::new(CHANNEL_GOSSIP, payload))
                    .await
                {
                    Ok(bytes) => {
                        if let Ok(view) =
                            bincode::deserialize::<MembershipView>(&bytes)
                        {
                            let _ =
                                myself.tell(GossipCommand::Merge(view)).await;
                        }
                    }
                    Err(e) => {
                        debug!("Gossip exchange with {} failed: {}", address, e);
                    }
                }
            });
        }
    }
}

#[async_trait]
impl Actor for Gossiper {
    type Message = GossipCommand;
    type Response = GossipResponse;
    type Event = MembershipEvent;

    async fn pre_start(
        &mut self,
        ctx: &mut ActorContext<Self>,
    ) -> Result<(), ActorError> {
        let changes = self
            .view
            .upsert(self.myself.clone())
            .into_iter()
            .collect();
        self.publish_changes(changes, ctx).await;

        // Schedule the periodic tick.
        let Some(myself) = ctx.reference().await else {
            return Err(ActorError::Start(
                "Can't get gossiper reference".to_owned(),
            ));
        };
        let cancel = self.cancel.clone();
        let interval = self.config.gossip_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if myself.tell(GossipCommand::Tick).await.is_err() {
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
impl Handler<Gossiper> for Gossiper {
    async fn handle_message(
        &mut self,
        _sender: ActorPath,
        msg: GossipCommand,
        ctx: &mut ActorContext<Gossiper>,
    ) -> Result<GossipResponse, ActorError> {
        match msg {
            GossipCommand::Tick => {
                self.refresh_suspicions(ctx).await;
                self.leader_duties(ctx).await;
                if let Some(myself) = ctx.reference().await {
                    self.gossip_round(myself);
                }
                Ok(GossipResponse::None)
            }
            GossipCommand::Remote(GossipWire::Heartbeat { from }) => {
                self.detector.heartbeat(&from, Instant::now());
                Ok(GossipResponse::None)
            }
            GossipCommand::Remote(GossipWire::Exchange { from, view }) => {
                self.detector.heartbeat(&from, Instant::now());
                let changes = self.view.merge(&view);
                self.publish_changes(changes, ctx).await;
                Ok(GossipResponse::View(self.view.clone()))
            }
            GossipCommand::Merge(view) => {
                let changes = self.view.merge(&view);
                self.publish_changes(changes, ctx).await;
                Ok(GossipResponse::None)
            }
            GossipCommand::Alive(node) => {
                self.detector.heartbeat(&node, Instant::now());
                Ok(GossipResponse::None)
            }
            GossipCommand::MarkDown(node) => {
                let marked = self
                    .view
                    .get(&node)
                    .map(|m| m.with_status(MemberStatus::Down));
                if let Some(marked) = marked {
                    let changes =
                        self.view.upsert(marked).into_iter().collect();
                    self.publish_changes(changes, ctx).await;
                }
                Ok(GossipResponse::None)
            }
            GossipCommand::Leave => {
                let leaving = self.myself.with_status(MemberStatus::Leaving);
                let changes =
                    self.view.upsert(leaving).into_iter().collect();
                self.publish_changes(changes, ctx).await;
                Ok(GossipResponse::None)
            }
            GossipCommand::GetView => {
                Ok(GossipResponse::View(self.view.clone()))
            }
        }
    }
}

/// Transport endpoint bridging gossip frames into the gossiper's mailbox.
pub struct GossipEndpoint {
    gossiper: ActorRef<Gossiper>,
}

impl GossipEndpoint {
    pub fn new(gossiper: ActorRef<Gossiper>) -> Self {
        GossipEndpoint { gossiper }
    }
}

#[async_trait]
impl FrameHandler for GossipEndpoint {
    async fn on_frame(&self, payload: Vec<u8>) -> Result<Vec<u8>, ClusterError> {
        let wire: GossipWire = bincode::deserialize(&payload)
            .map_err(|e| ClusterError::Codec(e.to_string()))?;
        let response = self
            .gossiper
            .ask(GossipCommand::Remote(wire))
            .await
            .map_err(|e| ClusterError::Gossip(e.to_string()))?;
        match response {
            GossipResponse::View(view) => bincode::serialize(&view)
                .map_err(|e| ClusterError::Codec(e.to_string())),
            GossipResponse::None => Ok(Vec::new()),
        }
    }
}
