// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Entities
//!
//! An entity is a game object (player, room, match) addressed by a stable
//! id and backed by exactly one live actor in the whole cluster. Game logic
//! implements the [`Entity`] trait: a command handler that, given the
//! current state and a command, decides a reply, a list of state changes
//! and follow-up sends. The handler never mutates state directly — changes
//! go through [`Entity::apply`], so durable entities replay to the same
//! state — and it never blocks: slow work is expressed as a delayed
//! follow-up command.
//!

use crate::error::DeliveryError;

use actor::{Error as ActorError, Event, Message, RestartPolicy, Response};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::oneshot;

use std::{
    fmt::{self, Debug},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Stable, globally unique identifier of an entity within its type.
#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        EntityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId(value.to_owned())
    }
}

/// Shard index an entity id maps to. Derived deterministically from the
/// entity id, stable for the entity's lifetime.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A game entity type.
///
/// `Command` is the tagged-variant message enum of the entity; dispatch is
/// an explicit match inside [`Entity::on_command`]. `Outcome` is the reply
/// returned to askers. `Change` is the journal entry type: the only way
/// state evolves.
pub trait Entity:
    Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Entity type name, used in actor paths and wire channels.
    const TYPE: &'static str;

    /// Whether state survives passivation through the persistence
    /// collaborator. Ephemeral entities are rebuilt from `initialize` on
    /// every activation.
    const DURABLE: bool = true;

    /// Commands addressed to one entity instance.
    type Command: Message + Debug + Serialize + DeserializeOwned;
    /// Reply returned to the sender of a command.
    type Outcome: Response + Debug + Clone + Serialize + DeserializeOwned;
    /// State change produced by a command and applied to the state.
    type Change: Event;

    /// Fresh state for an entity that has never been seen (or whose
    /// durable state was lost).
    fn initialize(id: &EntityId) -> Self;

    /// Decides the effects of a command. Must not mutate anything: state
    /// changes are returned as `Change` values and applied through
    /// [`Entity::apply`] after they are (optionally) persisted.
    fn on_command(
        &self,
        id: &EntityId,
        command: Self::Command,
    ) -> Result<Effects<Self>, ActorError>;

    /// Applies a change to the state. Must be deterministic: recovery
    /// replays the journal through this function.
    fn apply(&mut self, change: &Self::Change);

    /// Policy applied when `on_command` fails.
    fn restart_policy() -> RestartPolicy {
        RestartPolicy::Resume
    }

    /// Consecutive failures tolerated before the entity is reported as
    /// failed permanently.
    fn max_restarts() -> usize {
        3
    }
}

/// The outcome of one command: an optional reply, state changes to apply,
/// and follow-up commands to send.
#[derive(Debug, Clone)]
pub struct Effects<E: Entity> {
    pub reply: Option<E::Outcome>,
    pub changes: Vec<E::Change>,
    pub followups: Vec<FollowUp<E>>,
}

impl<E: Entity> Effects<E> {
    /// Effects with a reply and nothing else.
    pub fn reply(outcome: E::Outcome) -> Self {
        Effects {
            reply: Some(outcome),
            changes: Vec::new(),
            followups: Vec::new(),
        }
    }

    /// Effects with no reply.
    pub fn none() -> Self {
        Effects {
            reply: None,
            changes: Vec::new(),
            followups: Vec::new(),
        }
    }

    pub fn with_change(mut self, change: E::Change) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_followup(mut self, followup: FollowUp<E>) -> Self {
        self.followups.push(followup);
        self
    }
}

/// A command sent to an entity of the same type as a consequence of a
/// handled command. With `after` set, the send is scheduled instead of
/// immediate; this is how entities express timers and slow work without
/// blocking a handler.
#[derive(Debug, Clone)]
pub struct FollowUp<E: Entity> {
    pub to: EntityId,
    pub command: E::Command,
    pub after: Option<Duration>,
}

impl<E: Entity> FollowUp<E> {
    pub fn send(to: EntityId, command: E::Command) -> Self {
        FollowUp {
            to,
            command,
            after: None,
        }
    }

    pub fn schedule(to: EntityId, command: E::Command, after: Duration) -> Self {
        FollowUp {
            to,
            command,
            after: Some(after),
        }
    }
}

/// One-shot reply channel that can travel inside cloneable messages. The
/// first `send` wins; later sends (from redundant deliveries) are dropped.
pub struct ReplySlot<T>(Arc<Mutex<Option<oneshot::Sender<T>>>>);

impl<T: Send + 'static> ReplySlot<T> {
    /// Creates the slot and the receiver the caller awaits.
    pub fn channel() -> (Self, oneshot::Receiver<T>) {
        let (sender, receiver) = oneshot::channel();
        (ReplySlot(Arc::new(Mutex::new(Some(sender)))), receiver)
    }

    /// A slot whose reply nobody awaits.
    pub fn discard() -> Self {
        ReplySlot(Arc::new(Mutex::new(None)))
    }

    /// Resolves the slot. Dropped silently if already resolved or if the
    /// caller went away.
    pub fn send(&self, value: T) {
        let sender = {
            let Ok(mut guard) = self.0.lock() else {
                return;
            };
            guard.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(value);
        }
    }
}

impl<T> Clone for ReplySlot<T> {
    fn clone(&self) -> Self {
        ReplySlot(self.0.clone())
    }
}

impl<T> Debug for ReplySlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let resolved = self
            .0
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true);
        f.debug_struct("ReplySlot").field("resolved", &resolved).finish()
    }
}

/// Reply slot type used for entity deliveries.
pub type DeliverySlot<E> =
    ReplySlot<Result<<E as Entity>::Outcome, DeliveryError>>;

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn test_reply_slot_first_send_wins() {
        let (slot, receiver) = ReplySlot::<u32>::channel();
        let clone = slot.clone();
        clone.send(1);
        slot.send(2);
        assert_eq!(receiver.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_discard_slot_ignores_sends() {
        let slot = ReplySlot::<u32>::discard();
        slot.send(1);
    }
}
