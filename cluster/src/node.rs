// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Node identity
//!
//! A cluster node is identified by an ordered, opaque [`NodeId`] plus a
//! network [`NodeAddress`]. The `incarnation` counter disambiguates
//! successive lifetimes of the same node identity: a restarted node joins
//! with a higher incarnation, and gossip always prefers the higher one.
//!

use serde::{Deserialize, Serialize};

use std::fmt;

/// Opaque, totally ordered node identifier.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_owned())
    }
}

/// Network address of a node.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NodeAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Forward lifecycle of a member. Reachability is an overlay kept in the
/// membership view, not a lifecycle state: a member can be `Up` and
/// unreachable at the same time.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub enum MemberStatus {
    Joining,
    Up,
    Leaving,
    Exiting,
    Down,
}

impl MemberStatus {
    /// Position in the forward lifecycle. A status can only progress; a
    /// merge never picks a lower precedence for the same incarnation.
    pub fn precedence(&self) -> u8 {
        match self {
            MemberStatus::Joining => 0,
            MemberStatus::Up => 1,
            MemberStatus::Leaving => 2,
            MemberStatus::Exiting => 3,
            MemberStatus::Down => 4,
        }
    }

    /// Terminal states never revert for a given incarnation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MemberStatus::Exiting | MemberStatus::Down)
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MemberStatus::Joining => "joining",
            MemberStatus::Up => "up",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Exiting => "exiting",
            MemberStatus::Down => "down",
        };
        write!(f, "{}", name)
    }
}

/// Per-node membership record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: NodeAddress,
    pub status: MemberStatus,
    pub incarnation: u64,
}

impl Member {
    pub fn new(
        id: NodeId,
        address: NodeAddress,
        status: MemberStatus,
        incarnation: u64,
    ) -> Self {
        Member {
            id,
            address,
            status,
            incarnation,
        }
    }

    /// Returns a copy of this record with the status advanced. Callers must
    /// not regress the lifecycle; `MembershipView::merge` ignores
    /// regressions anyway.
    pub fn with_status(&self, status: MemberStatus) -> Self {
        let mut member = self.clone();
        member.status = status;
        member
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_status_precedence_is_monotone() {
        assert!(
            MemberStatus::Joining.precedence() < MemberStatus::Up.precedence()
        );
        assert!(
            MemberStatus::Up.precedence() < MemberStatus::Leaving.precedence()
        );
        assert!(
            MemberStatus::Leaving.precedence()
                < MemberStatus::Exiting.precedence()
        );
        assert!(
            MemberStatus::Exiting.precedence()
                < MemberStatus::Down.precedence()
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MemberStatus::Up.is_terminal());
        assert!(!MemberStatus::Leaving.is_terminal());
        assert!(MemberStatus::Exiting.is_terminal());
        assert!(MemberStatus::Down.is_terminal());
    }

    #[test]
    fn test_node_address_display() {
        let address = NodeAddress::new("127.0.0.1", 2551);
        assert_eq!(address.to_string(), "127.0.0.1:2551");
    }
}
