// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Membership view
//!
//! The eventually-consistent picture one node holds of the cluster. Views
//! converge by pairwise merging: per member the higher incarnation wins
//! wholesale, and within an incarnation the lifecycle only moves forward.
//! Reachability is an overlay derived from per-observer suspicion sets,
//! versioned so stale gossip can never resurrect a retracted suspicion.
//!
//! There is exactly one owned view value per node, mutated only through
//! [`MembershipView::merge`] and the local mutation methods; collaborators
//! receive clones, never shared references.
//!

use crate::node::{Member, MemberStatus, NodeId};

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet};

/// One observer's current suspicion set, tagged with a version so merges
/// keep only the newest set per observer.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Suspicion {
    pub version: u64,
    pub suspects: BTreeSet<NodeId>,
}

/// A change produced by merging or locally mutating a view. Consumers use
/// these to publish membership events.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MembershipChange {
    /// A member not previously in the view.
    Added(Member),
    /// A member whose status or incarnation progressed.
    Updated(Member),
    /// A member crossed the unreachability quorum, in either direction.
    ReachabilityChanged { member: Member, reachable: bool },
}

/// Per-node membership view.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MembershipView {
    members: BTreeMap<NodeId, Member>,
    suspicions: BTreeMap<NodeId, Suspicion>,
}

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Member> {
        self.members.get(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members currently in the `Up` state.
    pub fn up_members(&self) -> Vec<&Member> {
        self.members
            .values()
            .filter(|m| m.status == MemberStatus::Up)
            .collect()
    }

    /// Up members that are not unreachable.
    pub fn reachable_up_members(&self) -> Vec<&Member> {
        self.members
            .values()
            .filter(|m| {
                m.status == MemberStatus::Up && !self.is_unreachable(&m.id)
            })
            .collect()
    }

    /// The leader is the lowest reachable `Joining`/`Up` node (counting
    /// joining members lets a fresh cluster bootstrap itself). Leader
    /// duties are deterministic from the view, so converged views agree on
    /// the leader without an election.
    pub fn leader(&self) -> Option<&NodeId> {
        self.members
            .values()
            .find(|m| {
                matches!(
                    m.status,
                    MemberStatus::Joining | MemberStatus::Up
                ) && !self.is_unreachable(&m.id)
            })
            .map(|m| &m.id)
    }

    /// Incorporates a single member record, following the merge rules.
    /// Returns the resulting change, if the record told us anything new.
    pub fn upsert(&mut self, incoming: Member) -> Option<MembershipChange> {
        match self.members.get_mut(&incoming.id) {
            None => {
                self.members.insert(incoming.id.clone(), incoming.clone());
                Some(MembershipChange::Added(incoming))
            }
            Some(current) => {
                if incoming.incarnation > current.incarnation {
                    // A new incarnation replaces the record wholesale and
                    // clears stale suspicions against the previous one.
                    *current = incoming.clone();
                    for suspicion in self.suspicions.values_mut() {
                        suspicion.suspects.remove(&incoming.id);
                    }
                    Some(MembershipChange::Updated(incoming))
                } else if incoming.incarnation == current.incarnation
                    && incoming.status.precedence()
                        > current.status.precedence()
                {
                    current.status = incoming.status;
                    Some(MembershipChange::Updated(current.clone()))
                } else {
                    None
                }
            }
        }
    }

    /// Replaces one observer's suspicion set. The version must increase for
    /// the set to be applied; the gossiper bumps it on every local change.
    pub fn set_suspects(
        &mut self,
        observer: &NodeId,
        version: u64,
        suspects: BTreeSet<NodeId>,
    ) -> bool {
        let entry = self.suspicions.entry(observer.clone()).or_default();
        if version > entry.version {
            entry.version = version;
            entry.suspects = suspects;
            true
        } else {
            false
        }
    }

    /// Current version of one observer's suspicion set.
    pub fn suspicion_version(&self, observer: &NodeId) -> u64 {
        self.suspicions
            .get(observer)
            .map(|s| s.version)
            .unwrap_or(0)
    }

    /// Observers currently suspecting `id`. Only live observers count: a
    /// departed node must not keep votes against anyone.
    fn suspecting_observers(&self, id: &NodeId) -> usize {
        self.suspicions
            .iter()
            .filter(|(observer, suspicion)| {
                *observer != id
                    && suspicion.suspects.contains(id)
                    && self
                        .members
                        .get(observer)
                        .map(|m| !m.status.is_terminal())
                        .unwrap_or(false)
            })
            .count()
    }

    /// Quorum of observers needed to declare `id` unreachable: a majority
    /// of the non-terminal members other than `id` itself.
    fn quorum(&self, id: &NodeId) -> usize {
        let observers = self
            .members
            .values()
            .filter(|m| &m.id != id && !m.status.is_terminal())
            .count();
        observers / 2 + 1
    }

    /// True when a quorum of observers currently suspects the member.
    /// Unreachability is reversible: it flips back when observers retract
    /// their suspicion on renewed contact.
    pub fn is_unreachable(&self, id: &NodeId) -> bool {
        let Some(member) = self.members.get(id) else {
            return false;
        };
        if member.status.is_terminal() {
            return false;
        }
        self.suspecting_observers(id) >= self.quorum(id)
    }

    /// The set of currently unreachable members.
    pub fn unreachable(&self) -> BTreeSet<NodeId> {
        self.members
            .keys()
            .filter(|id| self.is_unreachable(id))
            .cloned()
            .collect()
    }

    /// Merges another view into this one and returns the changes. Merging
    /// is commutative on converged inputs and idempotent: replaying an
    /// already-seen view produces no changes and never regresses a status.
    pub fn merge(&mut self, other: &MembershipView) -> Vec<MembershipChange> {
        let before = self.unreachable();
        let mut changes = Vec::new();

        for member in other.members.values() {
            if let Some(change) = self.upsert(member.clone()) {
                changes.push(change);
            }
        }
        for (observer, suspicion) in &other.suspicions {
            self.set_suspects(
                observer,
                suspicion.version,
                suspicion.suspects.clone(),
            );
        }

        let after = self.unreachable();
        for id in after.difference(&before) {
            if let Some(member) = self.members.get(id) {
                changes.push(MembershipChange::ReachabilityChanged {
                    member: member.clone(),
                    reachable: false,
                });
            }
        }
        for id in before.difference(&after) {
            if let Some(member) = self.members.get(id) {
                changes.push(MembershipChange::ReachabilityChanged {
                    member: member.clone(),
                    reachable: true,
                });
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::node::NodeAddress;

    fn member(id: &str, status: MemberStatus, incarnation: u64) -> Member {
        Member::new(
            NodeId::from(id),
            NodeAddress::new("127.0.0.1", 2551),
            status,
            incarnation,
        )
    }

    #[test]
    fn test_upsert_new_member() {
        let mut view = MembershipView::new();
        let change = view.upsert(member("a", MemberStatus::Joining, 1));
        assert!(matches!(change, Some(MembershipChange::Added(_))));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_status_never_regresses_within_incarnation() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Up, 1));
        // A stale Joining record for the same incarnation changes nothing.
        assert!(view.upsert(member("a", MemberStatus::Joining, 1)).is_none());
        assert_eq!(
            view.get(&NodeId::from("a")).unwrap().status,
            MemberStatus::Up
        );
    }

    #[test]
    fn test_higher_incarnation_wins_wholesale() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Down, 1));
        let change = view.upsert(member("a", MemberStatus::Joining, 2));
        assert!(matches!(change, Some(MembershipChange::Updated(_))));
        let record = view.get(&NodeId::from("a")).unwrap();
        assert_eq!(record.status, MemberStatus::Joining);
        assert_eq!(record.incarnation, 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut left = MembershipView::new();
        left.upsert(member("a", MemberStatus::Up, 1));

        let mut right = MembershipView::new();
        right.upsert(member("a", MemberStatus::Up, 1));
        right.upsert(member("b", MemberStatus::Joining, 1));

        let first = left.merge(&right);
        assert_eq!(first.len(), 1);
        // Replaying the same view produces no further changes.
        let second = left.merge(&right);
        assert!(second.is_empty());
    }

    #[test]
    fn test_unreachable_requires_quorum() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Up, 1));
        view.upsert(member("b", MemberStatus::Up, 1));
        view.upsert(member("c", MemberStatus::Up, 1));

        let b = NodeId::from("b");
        // One of two observers is not a majority.
        view.set_suspects(
            &NodeId::from("a"),
            1,
            BTreeSet::from([b.clone()]),
        );
        assert!(!view.is_unreachable(&b));
        // The second observer completes the quorum.
        view.set_suspects(
            &NodeId::from("c"),
            1,
            BTreeSet::from([b.clone()]),
        );
        assert!(view.is_unreachable(&b));
        // Retracting a suspicion reverses unreachability.
        view.set_suspects(&NodeId::from("c"), 2, BTreeSet::new());
        assert!(!view.is_unreachable(&b));
    }

    #[test]
    fn test_stale_suspicions_are_ignored() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Up, 1));
        view.upsert(member("b", MemberStatus::Up, 1));

        let a = NodeId::from("a");
        assert!(view.set_suspects(
            &a,
            2,
            BTreeSet::from([NodeId::from("b")])
        ));
        // An older version must not replace a newer set.
        assert!(!view.set_suspects(&a, 1, BTreeSet::new()));
        assert_eq!(view.suspicion_version(&a), 2);
    }

    #[test]
    fn test_new_incarnation_clears_suspicions() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Up, 1));
        view.upsert(member("b", MemberStatus::Up, 1));
        view.upsert(member("c", MemberStatus::Up, 1));

        let b = NodeId::from("b");
        view.set_suspects(&NodeId::from("a"), 1, BTreeSet::from([b.clone()]));
        view.set_suspects(&NodeId::from("c"), 1, BTreeSet::from([b.clone()]));
        assert!(view.is_unreachable(&b));

        // The node restarted with a higher incarnation: old suspicions must
        // not apply to the new lifetime.
        view.upsert(member("b", MemberStatus::Joining, 2));
        assert!(!view.is_unreachable(&b));
    }

    #[test]
    fn test_merge_reports_reachability_changes() {
        let mut local = MembershipView::new();
        local.upsert(member("a", MemberStatus::Up, 1));
        local.upsert(member("b", MemberStatus::Up, 1));
        local.upsert(member("c", MemberStatus::Up, 1));
        let b = NodeId::from("b");
        local.set_suspects(&NodeId::from("a"), 1, BTreeSet::from([b.clone()]));

        let mut remote = local.clone();
        remote.set_suspects(&NodeId::from("c"), 1, BTreeSet::from([b.clone()]));

        let changes = local.merge(&remote);
        assert!(changes.iter().any(|c| matches!(
            c,
            MembershipChange::ReachabilityChanged { member, reachable: false }
                if member.id == b
        )));
    }

    #[test]
    fn test_leader_is_lowest_reachable_up() {
        let mut view = MembershipView::new();
        view.upsert(member("a", MemberStatus::Up, 1));
        view.upsert(member("b", MemberStatus::Up, 1));
        view.upsert(member("c", MemberStatus::Up, 1));
        assert_eq!(view.leader(), Some(&NodeId::from("a")));

        // When the lowest node becomes unreachable the next one leads.
        let a = NodeId::from("a");
        view.set_suspects(&NodeId::from("b"), 1, BTreeSet::from([a.clone()]));
        view.set_suspects(&NodeId::from("c"), 1, BTreeSet::from([a.clone()]));
        assert_eq!(view.leader(), Some(&NodeId::from("b")));
    }
}
