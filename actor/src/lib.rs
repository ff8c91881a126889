// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor runtime
//!
//! A typed actor runtime for building concurrent, fault-tolerant services
//! in Rust. Actors own their mutable state exclusively and communicate only
//! through message passing: each actor's mailbox is processed strictly one
//! message at a time, in enqueue order, while different actors run in
//! parallel on the runtime's thread pool. This mailbox isolation replaces
//! locks as the concurrency-safety mechanism.
//!
//! In response to a message an actor can update its private state, create
//! supervised child actors, send messages to other actors and publish
//! events to its event bus. Handlers must never block a worker thread on
//! I/O: slow operations are dispatched to tasks whose completion re-enters
//! the actor as a new message.
//!
//! Failures are handled at two levels. An actor that fails to *start* is
//! governed by its [`SupervisionStrategy`] (stop, or retry with a backoff
//! schedule). An actor whose *handler* fails is governed by its
//! [`RestartPolicy`] — resume with the prior state, restart with a fresh
//! one, or stop — and escalates to its parent once its restart budget is
//! exhausted.
//!
//! ## Example
//!
//! ```ignore
//! use actor::{Actor, ActorContext, ActorPath, ActorSystem, Error, Handler, Message, Response};
//! use async_trait::async_trait;
//!
//! struct Counter {
//!     value: u64,
//! }
//!
//! #[derive(Debug, Clone)]
//! struct Increment(u64);
//! impl Message for Increment {}
//!
//! #[async_trait]
//! impl Actor for Counter {
//!     type Message = Increment;
//!     type Event = ();
//!     type Response = u64;
//! }
//!
//! #[async_trait]
//! impl Handler<Counter> for Counter {
//!     async fn handle_message(
//!         &mut self,
//!         _sender: ActorPath,
//!         msg: Increment,
//!         _ctx: &mut ActorContext<Self>,
//!     ) -> Result<u64, Error> {
//!         self.value += msg.0;
//!         Ok(self.value)
//!     }
//! }
//! ```

mod actor;
mod error;
mod handler;
mod path;
mod runner;
mod sink;
mod supervision;
mod system;

pub use actor::{
    Actor, ActorContext, ActorLifecycle, ActorRef, ChildAction, Event,
    Handler, Message, Response,
};
pub use error::Error;
pub use path::ActorPath;
pub use sink::{Sink, Subscriber};
pub use supervision::{
    ExponentialBackoffStrategy, FixedIntervalStrategy, NoIntervalStrategy,
    RestartPolicy, RetryStrategy, Strategy, SupervisionStrategy,
};
pub use system::{ActorSystem, SystemEvent, SystemRef, SystemRunner};
