// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Errors module
//!

use crate::ActorPath;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for the actor system.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An error occurred while sending a message to an actor.
    #[error("An error occurred while sending a message to actor: {0}.")]
    Send(String),
    /// An error occurred while receiving a message from an actor.
    #[error("An error occurred while receiving a message from {0}: {1}.")]
    Receive(ActorPath, String),
    /// An actor with the same path already exists.
    #[error("Actor {0} exists.")]
    Exists(ActorPath),
    /// An error occurred while starting an actor.
    #[error("An error occurred while starting an actor: {0}")]
    Start(String),
    /// An error occurred while stopping an actor.
    #[error("An error occurred while stopping an actor.")]
    Stop,
    /// An error occurred while sending an event to the event bus.
    #[error("An error occurred while sending an event to the event bus: {0}")]
    SendEvent(String),
    /// A message handler failed.
    #[error("Handler failure: {0}")]
    Handler(String),
    /// The actor exhausted its restart budget.
    #[error("Actor {0} failed permanently: {1}")]
    FailedPermanently(ActorPath, String),
    /// Store error.
    #[error("Store error: {0}")]
    Store(String),
    /// Retries exhausted.
    #[error("Retries exhausted.")]
    Retry,
    /// Error that does not compromise the operation of the system.
    #[error("Error: {0}")]
    Functional(String),
}
