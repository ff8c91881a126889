// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster membership
//!
//! Gossip-based, eventually-consistent membership for a set of nodes.
//! Every node owns a single [`MembershipView`] value, mutated only by the
//! gossip merge function; views converge by periodic pairwise exchange.
//! Node failures are detected by a fixed-threshold heartbeat detector and
//! confirmed by a quorum of observers; unreachability is reversible,
//! whereas `Down` and `Exiting` are terminal for a node's incarnation.
//!
//! The crate also defines the channel-tagged node-to-node [`Transport`]
//! contract, with an in-process loopback implementation used by tests.
//!

mod config;
mod detector;
mod error;
mod gossip;
mod listener;
mod node;
mod transport;
mod view;

pub use config::ClusterConfig;
pub use detector::FailureDetector;
pub use error::Error;
pub use gossip::{
    CHANNEL_GOSSIP, GossipCommand, GossipEndpoint, GossipResponse, GossipWire,
    Gossiper, MembershipEvent,
};
pub use listener::ClusterListener;
pub use node::{Member, MemberStatus, NodeAddress, NodeId};
pub use transport::{Frame, FrameHandler, LoopbackTransport, Transport};
pub use view::{MembershipChange, MembershipView, Suspicion};
