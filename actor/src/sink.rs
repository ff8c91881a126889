// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Event sink
//!
//! Sink/subscriber pattern for processing actor events outside the actor
//! tree. Sinks run in their own task and receive events from an actor's
//! broadcast channel.
//!

use crate::Event;

use async_trait::async_trait;
use tokio::sync::broadcast::{Receiver as EventReceiver, error::RecvError};

use tracing::debug;

/// A sink that receives events from an actor and notifies a subscriber.
pub struct Sink<E: Event> {
    /// The subscriber that will be notified of events.
    subscriber: Box<dyn Subscriber<E>>,
    /// The broadcast receiver for actor events.
    event_receiver: EventReceiver<E>,
}

impl<E: Event> Sink<E> {
    /// Creates a new sink from an actor's event receiver and a subscriber.
    pub fn new(
        event_receiver: EventReceiver<E>,
        subscriber: impl Subscriber<E>,
    ) -> Self {
        Sink {
            subscriber: Box::new(subscriber),
            event_receiver,
        }
    }

    /// Runs the sink's event processing loop until the event channel is
    /// closed. Lagged events are skipped.
    pub async fn run(&mut self) {
        loop {
            match self.event_receiver.recv().await {
                Ok(event) => {
                    debug!(
                        "Received event: {:?}. Notify to the subscriber.",
                        event
                    );
                    self.subscriber.notify(event).await;
                }
                Err(error) => match error {
                    RecvError::Closed => break,
                    RecvError::Lagged(_) => {
                        continue;
                    }
                },
            }
        }
    }
}

/// Trait for types that can receive and process actor events.
#[async_trait]
pub trait Subscriber<E: Event>: Send + Sync + 'static {
    /// Called when an event is received by the sink.
    async fn notify(&self, event: E);
}
