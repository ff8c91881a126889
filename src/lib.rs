//! Core library for the Arena framework.
//! Distributed, cluster-aware game-server infrastructure assembled from
//! location-transparent actors: a typed actor runtime, gossip-based
//! cluster membership, and a sharding layer that routes messages to game
//! entities by id across a dynamically changing set of nodes.

pub use actor::{
    Actor, ActorContext, ActorPath, ActorRef, ActorSystem, ChildAction,
    Error as ActorError, Event, ExponentialBackoffStrategy,
    FixedIntervalStrategy, Handler, Message, NoIntervalStrategy,
    Response, RestartPolicy, RetryStrategy, Sink, Strategy, Subscriber,
    SupervisionStrategy, SystemEvent, SystemRef, SystemRunner,
};

pub use cluster::{
    ClusterConfig, ClusterListener, Error as ClusterError, Frame,
    FrameHandler, Gossiper, LoopbackTransport, Member, MemberStatus,
    MembershipEvent, MembershipView, NodeAddress, NodeId, Transport,
};

pub use sharding::{
    DeliveryError, Effects, Entity, EntityClient, EntityId, FollowUp,
    ShardCoordinator, ShardId, ShardRegion, ShardedNode, ShardingConfig,
};

pub use store::{
    Collection, DbManager, Error as StoreError, MemoryManager,
    PersistentActor, STORE_MANAGER, Store, StoreCommand, StoreResponse,
};
