// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Message handling internals
//!
//! Mailbox plumbing for actors: the type-erased message wrapper, the
//! unbounded mailbox channels and the handle used by [`crate::ActorRef`]
//! to enqueue messages.
//!

use crate::{
    ActorPath, Error,
    actor::{Actor, ActorContext, Handler},
};

use async_trait::async_trait;

use tokio::sync::{mpsc, oneshot};

use tracing::{debug, error};

use std::marker::PhantomData;

/// Message handler trait for processing actor messages.
/// This trait abstracts the handling of different message types, allowing
/// the runner to process messages uniformly regardless of whether they
/// expect a response or not.
#[async_trait]
pub trait MessageHandler<A: Actor>: Send + Sync {
    /// Handles a message for the given actor.
    async fn handle(&mut self, actor: &mut A, ctx: &mut ActorContext<A>);
}

/// Internal actor message wrapper that encapsulates the message content,
/// sender path and optional response channel for request-response patterns.
struct ActorMessage<A>
where
    A: Actor + Handler<A>,
{
    /// The actual message to be processed by the actor.
    message: A::Message,
    /// The path of the actor that sent this message.
    sender: ActorPath,
    /// Optional response channel. `Some` for ask, `None` for tell.
    rsvp: Option<oneshot::Sender<Result<A::Response, Error>>>,
    _phantom_actor: PhantomData<A>,
}

impl<A> ActorMessage<A>
where
    A: Actor + Handler<A>,
{
    pub fn new(
        message: A::Message,
        sender: ActorPath,
        rsvp: Option<oneshot::Sender<Result<A::Response, Error>>>,
    ) -> Self {
        Self {
            message,
            sender,
            rsvp,
            _phantom_actor: PhantomData,
        }
    }
}

/// Message handler implementation for the internal actor message. Delegates
/// to the actor's `handle_message` and, if a response channel exists, sends
/// the result back to the caller. A handler error is additionally recorded
/// in the context so the runner can apply the actor's restart policy.
#[async_trait]
impl<A> MessageHandler<A> for ActorMessage<A>
where
    A: Actor + Handler<A>,
{
    async fn handle(&mut self, actor: &mut A, ctx: &mut ActorContext<A>) {
        let result = actor
            .handle_message(self.sender.clone(), self.message.clone(), ctx)
            .await;

        if let Err(error) = &result {
            debug!("Handler of {} failed: {}", ctx.path(), error);
            ctx.record_handler_failure(error.clone());
        }

        if let Some(rsvp) = self.rsvp.take() {
            rsvp.send(result).unwrap_or_else(|_failed| {
                error!("Failed to send back response!");
            })
        }
    }
}

/// Boxed message handler for type-erased message handling.
pub type BoxedMessageHandler<A> = Box<dyn MessageHandler<A>>;

/// Mailbox receiver side, consumed by the actor's runner.
pub type MailboxReceiver<A> = mpsc::UnboundedReceiver<BoxedMessageHandler<A>>;

/// Mailbox sender side, shared by every reference to the actor.
pub type MailboxSender<A> = mpsc::UnboundedSender<BoxedMessageHandler<A>>;

/// Complete mailbox tuple containing both sender and receiver sides.
pub type Mailbox<A> = (MailboxSender<A>, MailboxReceiver<A>);

/// Creates a new unbounded mailbox for an actor. The unbounded channel keeps
/// message sends from blocking; backpressure is managed at the application
/// level.
pub fn mailbox<A>() -> Mailbox<A> {
    mpsc::unbounded_channel()
}

/// Handle helper for sending messages to an actor. Wraps the mailbox sender
/// and provides the typed `tell` and `ask` operations.
pub struct HandleHelper<A> {
    sender: MailboxSender<A>,
}

impl<A> HandleHelper<A>
where
    A: Actor + Handler<A>,
{
    pub(crate) fn new(sender: MailboxSender<A>) -> Self {
        Self { sender }
    }

    /// Enqueues a message without expecting a response.
    pub(crate) async fn tell(
        &self,
        sender: ActorPath,
        message: A::Message,
    ) -> Result<(), Error> {
        let msg = ActorMessage::new(message, sender, None);
        if let Err(error) = self.sender.send(Box::new(msg)) {
            debug!("Failed to tell message! {}", error.to_string());
            Err(Error::Send(error.to_string()))
        } else {
            Ok(())
        }
    }

    /// Enqueues a message and waits for the response.
    pub(crate) async fn ask(
        &self,
        sender: ActorPath,
        message: A::Message,
    ) -> Result<A::Response, Error> {
        let (response_sender, response_receiver) = oneshot::channel();
        let msg = ActorMessage::new(message, sender, Some(response_sender));
        if let Err(error) = self.sender.send(Box::new(msg)) {
            error!("Failed to ask message! {}", error.to_string());
            Err(Error::Send(error.to_string()))
        } else {
            response_receiver
                .await
                .map_err(|error| Error::Send(error.to_string()))?
        }
    }

    /// Waits until every sender has been dropped.
    pub async fn close(&self) {
        self.sender.closed().await;
    }

    /// True if the actor's mailbox is closed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<A> Clone for HandleHelper<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    struct Probe;

    #[async_trait]
    impl Actor for Probe {
        type Message = ();
        type Event = ();
        type Response = ();
    }

    #[async_trait]
    impl Handler<Probe> for Probe {
        async fn handle_message(
            &mut self,
            _sender: ActorPath,
            _msg: (),
            _ctx: &mut ActorContext<Probe>,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_mailbox() {
        let (sender, receiver) = mailbox::<Probe>();
        assert!(!sender.is_closed());
        assert!(!receiver.is_closed());
    }
}
