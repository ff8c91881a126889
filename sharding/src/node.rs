// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Sharded node
//!
//! Per-node wiring of the whole stack: the actor system, the gossiper and
//! its transport endpoint, one region (plus endpoint) per registered
//! entity type, and — on the designated coordinator node — one coordinator
//! per entity type. Membership events flow from the gossiper's event bus
//! into the region and coordinator mailboxes through sink relays.
//!
//! The coordinator runs on the node named by `coordinator`; its
//! assignment table is journaled through the store manager, so a restarted
//! coordinator node resumes from the assignments it last confirmed.
//!

use crate::{
    client::EntityClient,
    config::ShardingConfig,
    coordinator::{
        CoordinatorCommand, CoordinatorEndpoint, ShardCoordinator,
    },
    entity::Entity,
    region::{RegionCommand, ShardRegion, region_name},
    wire::{RegionEndpoint, coordinator_channel, region_channel},
};

use actor::{
    ActorRef, ActorSystem, Error as ActorError, Sink, Subscriber, SystemRef,
};
use cluster::{
    CHANNEL_GOSSIP, ClusterConfig, ClusterListener, GossipCommand,
    GossipEndpoint, GossipResponse, Gossiper, Member, MemberStatus,
    MembershipEvent, MembershipView, NodeAddress, NodeId, Transport,
};
use store::{DbManager, STORE_MANAGER};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::{collections::HashMap, sync::Arc};

/// Relays membership events into a region's mailbox.
struct RegionRelay<E: Entity> {
    region: ActorRef<ShardRegion<E>>,
}

#[async_trait]
impl<E: Entity> Subscriber<MembershipEvent> for RegionRelay<E> {
    async fn notify(&self, event: MembershipEvent) {
        let _ = self
            .region
            .tell(RegionCommand::MemberEvent(event))
            .await;
    }
}

/// Relays membership events into a coordinator's mailbox.
struct CoordinatorRelay {
    coordinator: ActorRef<ShardCoordinator>,
}

#[async_trait]
impl Subscriber<MembershipEvent> for CoordinatorRelay {
    async fn notify(&self, event: MembershipEvent) {
        let _ = self
            .coordinator
            .tell(CoordinatorCommand::MemberEvent(event))
            .await;
    }
}

/// One game-server node: membership plus sharding for the entity types it
/// registers.
pub struct ShardedNode {
    myself: Member,
    coordinator: NodeId,
    cluster_config: ClusterConfig,
    sharding_config: ShardingConfig,
    system: SystemRef,
    gossiper: ActorRef<Gossiper>,
    transport: Arc<dyn Transport>,
    token: CancellationToken,
}

impl ShardedNode {
    /// Starts the node: actor system, store manager helper, gossiper and
    /// gossip endpoint. Entity types are registered separately.
    ///
    /// `incarnation` disambiguates successive lifetimes of the same node
    /// id; a restarted node must join with a higher value (wall-clock
    /// milliseconds work well).
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        node: NodeId,
        address: NodeAddress,
        seeds: Vec<NodeAddress>,
        coordinator: NodeId,
        incarnation: u64,
        cluster_config: ClusterConfig,
        sharding_config: ShardingConfig,
        transport: Arc<dyn Transport>,
        store_manager: Arc<dyn DbManager>,
    ) -> Result<Self, ActorError> {
        let token = CancellationToken::new();
        let (system, mut runner) = ActorSystem::create(token.clone());
        tokio::spawn(async move {
            runner.run().await;
        });
        system.add_helper(STORE_MANAGER, store_manager).await;

        let myself = Member::new(
            node,
            address.clone(),
            MemberStatus::Joining,
            incarnation,
        );
        let gossiper = Gossiper::new(
            myself.clone(),
            seeds,
            cluster_config.clone(),
            transport.clone(),
        );
        let gossiper = system.create_root_actor("gossiper", gossiper).await?;
        transport
            .bind(
                address,
                CHANNEL_GOSSIP,
                Arc::new(GossipEndpoint::new(gossiper.clone())),
            )
            .await;
        system
            .run_sink(Sink::new(gossiper.subscribe(), ClusterListener))
            .await;

        debug!("Node {} started.", myself.id);
        Ok(ShardedNode {
            myself,
            coordinator,
            cluster_config,
            sharding_config,
            system,
            gossiper,
            transport,
            token,
        })
    }

    /// Registers an entity type on this node: region, wire endpoint,
    /// membership relay and — on the coordinator node — the coordinator
    /// singleton. Returns the client used to reach entities of the type.
    pub async fn register_entity<E: Entity>(
        &self,
    ) -> Result<EntityClient<E>, ActorError> {
        let config = &self.sharding_config;
        let mut known = HashMap::new();
        known.insert(
            self.myself.id.clone(),
            self.myself.address.clone(),
        );
        let region = ShardRegion::<E>::new(
            self.myself.id.clone(),
            self.coordinator.clone(),
            config.clone(),
            self.transport.clone(),
            known,
        );
        let region = self
            .system
            .create_root_actor(&region_name::<E>(), region)
            .await?;
        self.transport
            .bind(
                self.myself.address.clone(),
                &region_channel(E::TYPE),
                Arc::new(RegionEndpoint::new(
                    region.clone(),
                    config.ask_timeout,
                    config.handoff_timeout,
                )),
            )
            .await;
        self.system
            .run_sink(Sink::new(
                self.gossiper.subscribe(),
                RegionRelay {
                    region: region.clone(),
                },
            ))
            .await;

        if self.myself.id == self.coordinator {
            let coordinator = ShardCoordinator::new(
                E::TYPE,
                config.clone(),
                self.transport.clone(),
            );
            let coordinator = self
                .system
                .create_root_actor(
                    &format!("coordinator-{}", E::TYPE),
                    coordinator,
                )
                .await?;
            self.transport
                .bind(
                    self.myself.address.clone(),
                    &coordinator_channel(E::TYPE),
                    Arc::new(CoordinatorEndpoint::new(
                        coordinator.clone(),
                        config.allocation_timeout,
                    )),
                )
                .await;
            self.system
                .run_sink(Sink::new(
                    self.gossiper.subscribe(),
                    CoordinatorRelay {
                        coordinator: coordinator.clone(),
                    },
                ))
                .await;
            // Events published before the relay existed are replayed from
            // the current view.
            self.sync_members(&coordinator).await?;
        }
        self.sync_region(&region).await?;

        Ok(EntityClient::new(region, config.ask_timeout))
    }

    /// Replays the current membership view into a freshly created region.
    async fn sync_region<E: Entity>(
        &self,
        region: &ActorRef<ShardRegion<E>>,
    ) -> Result<(), ActorError> {
        for member in self.view().await?.members() {
            let _ = region
                .tell(RegionCommand::MemberEvent(
                    MembershipEvent::MemberJoined(member.clone()),
                ))
                .await;
        }
        Ok(())
    }

    /// Replays the current membership view into a fresh coordinator.
    async fn sync_members(
        &self,
        coordinator: &ActorRef<ShardCoordinator>,
    ) -> Result<(), ActorError> {
        for member in self.view().await?.members() {
            let joined =
                MembershipEvent::MemberJoined(member.clone());
            let _ = coordinator
                .tell(CoordinatorCommand::MemberEvent(joined))
                .await;
            if member.status == MemberStatus::Up {
                let _ = coordinator
                    .tell(CoordinatorCommand::MemberEvent(
                        MembershipEvent::MemberUp(member.clone()),
                    ))
                    .await;
            }
        }
        Ok(())
    }

    /// The node's current membership view.
    pub async fn view(&self) -> Result<MembershipView, ActorError> {
        match self.gossiper.ask(GossipCommand::GetView).await? {
            GossipResponse::View(view) => Ok(view),
            GossipResponse::None => Err(ActorError::Functional(
                "gossiper returned no view".to_owned(),
            )),
        }
    }

    /// A client for an already registered entity type.
    pub async fn client<E: Entity>(&self) -> Option<EntityClient<E>> {
        let region = self
            .system
            .get_actor::<ShardRegion<E>>(&crate::region::region_path::<E>())
            .await?;
        Some(EntityClient::new(region, self.sharding_config.ask_timeout))
    }

    /// Starts leaving the cluster gracefully.
    pub async fn leave(&self) -> Result<(), ActorError> {
        self.gossiper.tell(GossipCommand::Leave).await
    }

    /// Marks another node as down (administrative decision).
    pub async fn mark_down(&self, node: NodeId) -> Result<(), ActorError> {
        self.gossiper.tell(GossipCommand::MarkDown(node)).await
    }

    /// Stops every actor of this node.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn node_id(&self) -> &NodeId {
        &self.myself.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.myself.address
    }

    pub fn system(&self) -> &SystemRef {
        &self.system
    }

    pub fn gossiper(&self) -> &ActorRef<Gossiper> {
        &self.gossiper
    }

    pub fn cluster_config(&self) -> &ClusterConfig {
        &self.cluster_config
    }
}
