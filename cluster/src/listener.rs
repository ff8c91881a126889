// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Cluster listener
//!

use crate::gossip::MembershipEvent;

use actor::Subscriber;

use async_trait::async_trait;
use tracing::info;

/// Logs membership transitions as they are observed by the local node.
/// Attach it as a sink on the gossiper's event bus.
pub struct ClusterListener;

#[async_trait]
impl Subscriber<MembershipEvent> for ClusterListener {
    async fn notify(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::MemberJoined(m) => {
                info!("Member joined: {} at {}.", m.id, m.address)
            }
            MembershipEvent::MemberUp(m) => info!("Member up: {}.", m.id),
            MembershipEvent::MemberLeaving(m) => {
                info!("Member leaving: {}.", m.id)
            }
            MembershipEvent::MemberExited(m) => {
                info!("Member exited: {}.", m.id)
            }
            MembershipEvent::MemberDown(m) => {
                info!("Member down: {}.", m.id)
            }
            MembershipEvent::MemberUnreachable(m) => {
                info!("Member unreachable: {}.", m.id)
            }
            MembershipEvent::MemberReachable(m) => {
                info!("Member reachable again: {}.", m.id)
            }
        }
    }
}
