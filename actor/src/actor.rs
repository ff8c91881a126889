// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor
//!
//! The `actor` module provides the [`Actor`] trait and the [`ActorRef`]
//! type. The `Actor` trait is the main trait that actors must implement;
//! an `ActorRef` is a reference to a running actor that can be used to send
//! messages to it.
//!

use crate::{
    ActorPath, Error,
    handler::HandleHelper,
    runner::{InnerAction, InnerSender, StopSender},
    supervision::{RestartPolicy, SupervisionStrategy},
    system::SystemRef,
};

use tokio::sync::{broadcast::Receiver as EventReceiver, mpsc, oneshot};

use async_trait::async_trait;

use serde::{Serialize, de::DeserializeOwned};

use tracing::debug;

use std::fmt::Debug;

/// Actor execution context, giving access to system services and to the
/// actor's own lifecycle.
///
/// The context is handed to every lifecycle hook and message handler. It is
/// the way an actor creates supervised children, publishes events, reports
/// errors and stops itself.
pub struct ActorContext<A: Actor + Handler<A>> {
    /// Channel sender for stopping this actor.
    stop: StopSender,
    /// Hierarchical path identifying this actor in the system.
    path: ActorPath,
    /// Reference to the actor system for global operations.
    system: SystemRef,
    /// Current error state of the actor, if any.
    error: Option<Error>,
    /// Error raised by the last message handler, if any. Consumed by the
    /// runner to apply the actor's restart policy.
    handler_failure: Option<Error>,
    /// Channel for reporting errors to the parent actor.
    error_sender: ChildErrorSender,
    /// Internal communication channel towards the runner.
    inner_sender: InnerSender<A>,
    /// Stop senders for child actors under supervision.
    child_senders: Vec<StopSender>,
}

impl<A> ActorContext<A>
where
    A: Actor + Handler<A>,
{
    /// Creates a new actor context. Called by the runner during actor
    /// creation; not intended for user code.
    pub(crate) fn new(
        stop: StopSender,
        path: ActorPath,
        system: SystemRef,
        error_sender: ChildErrorSender,
        inner_sender: InnerSender<A>,
    ) -> Self {
        Self {
            stop,
            path,
            system,
            error: None,
            handler_failure: None,
            error_sender,
            inner_sender,
            child_senders: Vec::new(),
        }
    }

    /// Invokes the actor's `pre_restart` hook. Used by the supervision
    /// machinery when an actor is restarted after a failure.
    pub(crate) async fn restart(
        &mut self,
        actor: &mut A,
        error: Option<&Error>,
    ) -> Result<(), Error>
    where
        A: Actor,
    {
        actor.pre_restart(self, error).await
    }

    /// Returns a reference to this actor, if it is still registered in the
    /// system.
    pub async fn reference(&self) -> Option<ActorRef<A>> {
        self.system.get_actor(&self.path).await
    }

    /// Returns the path of this actor.
    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    /// Returns the actor system reference.
    pub fn system(&self) -> &SystemRef {
        &self.system
    }

    /// Returns a reference to the parent actor, if any.
    pub async fn parent<P: Actor + Handler<P>>(&self) -> Option<ActorRef<P>> {
        self.system.get_actor(&self.path.parent()).await
    }

    /// Stops all child actors, waiting for each to confirm.
    pub(crate) async fn stop_childs(&mut self) {
        while let Some(sender) = self.child_senders.pop() {
            let (stop_sender, stop_receiver) = oneshot::channel();
            if sender.send(Some(stop_sender)).await.is_err() {
                continue;
            } else {
                let _ = stop_receiver.await;
            };
        }
    }

    /// Removes this actor from the system registry.
    pub(crate) async fn remove_actor(&self) {
        self.system.remove_actor(&self.path).await;
    }

    /// Requests this actor to stop. The optional sender is notified once
    /// the stop completes.
    pub async fn stop(&self, sender: Option<oneshot::Sender<()>>) {
        debug!("Stopping actor {}.", self.path);
        let _ = self.stop.send(sender).await;
    }

    /// Publishes an event to this actor's event bus.
    pub async fn publish_event(&self, event: A::Event) -> Result<(), Error> {
        self.inner_sender
            .send(InnerAction::Event(event))
            .map_err(|e| Error::SendEvent(e.to_string()))
    }

    /// Reports a non-fatal error to the parent actor.
    pub async fn emit_error(&mut self, error: Error) -> Result<(), Error> {
        self.inner_sender
            .send(InnerAction::Error(error))
            .map_err(|e| Error::Send(e.to_string()))
    }

    /// Reports a fatal failure. The parent's supervision decision determines
    /// whether this actor restarts or stops.
    pub async fn emit_fail(&mut self, error: Error) -> Result<(), Error> {
        // Store error to stop message handling.
        self.set_error(error.clone());
        self.inner_sender
            .send(InnerAction::Fail(error))
            .map_err(|e| Error::Send(e.to_string()))
    }

    /// Creates a supervised child actor under this actor's path.
    pub async fn create_child<C>(
        &mut self,
        name: &str,
        actor: C,
    ) -> Result<ActorRef<C>, Error>
    where
        C: Actor + Handler<C>,
    {
        let path = self.path.clone() / name;
        let (actor_ref, stop_sender) = self
            .system
            .create_actor_path(path, actor, Some(self.error_sender.clone()))
            .await?;
        self.child_senders.push(stop_sender);
        Ok(actor_ref)
    }

    /// Returns a reference to a child actor by name.
    pub async fn get_child<C>(&self, name: &str) -> Option<ActorRef<C>>
    where
        C: Actor + Handler<C>,
    {
        let path = self.path.clone() / name;
        self.system.get_actor(&path).await
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.error.clone()
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub(crate) fn clean_error(&mut self) {
        self.error = None;
    }

    /// Records a handler failure for the runner to consume.
    pub(crate) fn record_handler_failure(&mut self, error: Error) {
        self.handler_failure = Some(error);
    }

    /// Takes the last recorded handler failure, if any.
    pub(crate) fn take_handler_failure(&mut self) -> Option<Error> {
        self.handler_failure.take()
    }
}

/// Lifecycle states of an actor, as tracked by its runner.
#[derive(Debug, Clone, PartialEq)]
pub enum ActorLifecycle {
    Created,
    Started,
    Restarted,
    Failed,
    Stopped,
    Terminated,
}

/// Possible actions a parent can take on a faulted child actor.
#[derive(Debug, Clone)]
pub enum ChildAction {
    /// Stop the child.
    Stop,
    /// Restart the child through its `pre_restart` hook.
    Restart,
    /// Delegate the decision; currently treated as a restart.
    Delegate,
}

/// Channel receiver for child errors.
pub(crate) type ChildErrorReceiver = mpsc::UnboundedReceiver<ChildError>;

/// Channel sender for child errors.
pub(crate) type ChildErrorSender = mpsc::UnboundedSender<ChildError>;

/// Error notifications flowing from a child actor to its parent.
pub enum ChildError {
    /// Non-fatal error, for visibility only.
    Error { error: Error },
    /// Fatal fault requiring a supervision decision.
    Fault {
        error: Error,
        sender: oneshot::Sender<ChildAction>,
    },
}

/// The fundamental actor trait.
///
/// An actor owns private mutable state and processes the messages sent to
/// its mailbox strictly one at a time, in enqueue order. In response to a
/// message it can mutate its state, create supervised children, send
/// messages to other actors and publish events. Handlers must never block:
/// slow operations are dispatched to tasks whose completion re-enters the
/// mailbox as a new message.
///
/// The lifecycle hooks default to no-ops; `pre_restart` defaults to running
/// `pre_start` again.
#[async_trait]
pub trait Actor: Send + Sync + Sized + 'static + Handler<Self> {
    /// The message type this actor accepts.
    type Message: Message;
    /// The event type this actor publishes.
    type Event: Event;
    /// The response type returned to askers.
    type Response: Response;

    /// Supervision strategy applied when the actor fails to start.
    fn supervision_strategy() -> SupervisionStrategy {
        SupervisionStrategy::Stop
    }

    /// Policy applied when a message handler returns an error.
    fn restart_policy() -> RestartPolicy {
        RestartPolicy::Resume
    }

    /// Consecutive handler failures tolerated before the failure is
    /// escalated to the parent actor.
    fn max_restarts() -> usize {
        3
    }

    /// Called before the actor starts processing messages.
    async fn pre_start(
        &mut self,
        _context: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called when the actor is restarted after a failure.
    async fn pre_restart(
        &mut self,
        ctx: &mut ActorContext<Self>,
        _error: Option<&Error>,
    ) -> Result<(), Error> {
        self.pre_start(ctx).await
    }

    /// Called before the actor stops, while it can still reach its children.
    async fn pre_stop(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called after the actor has stopped.
    async fn post_stop(
        &mut self,
        _ctx: &mut ActorContext<Self>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Trait for events published by actors. Events are broadcast to every
/// subscriber of the actor's event channel.
pub trait Event:
    Serialize + DeserializeOwned + Debug + Clone + Send + Sync + 'static
{
}

impl Event for () {}

/// Trait implemented by all messages that can be sent to actors.
pub trait Message: Clone + Send + Sync + 'static {}

impl Message for () {}

/// Trait implemented by all responses returned by actors.
pub trait Response: Send + Sync + 'static {}

impl Response for () {}
impl Response for bool {}
impl Response for u64 {}
impl Response for usize {}
impl Response for String {}

/// Message handling for an actor.
///
/// `handle_message` is invoked by the runner for each mailbox message, one
/// at a time. Returning an `Err` counts as a handler failure: the runner
/// applies the actor's [`RestartPolicy`] and, once the restart budget is
/// exhausted, escalates to the parent through `on_child_fault`.
#[async_trait]
pub trait Handler<A: Actor + Handler<A>>: Send + Sync {
    /// Handles a message and produces a response.
    async fn handle_message(
        &mut self,
        sender: ActorPath,
        msg: A::Message,
        ctx: &mut ActorContext<A>,
    ) -> Result<A::Response, Error>;

    /// Called for events this actor published, after delivery to the bus.
    async fn on_event(&mut self, _event: A::Event, _ctx: &mut ActorContext<A>) {
        // Default implementation.
    }

    /// Called when a child actor reports a non-fatal error.
    async fn on_child_error(
        &mut self,
        error: Error,
        _ctx: &mut ActorContext<A>,
    ) {
        debug!("Handling child error: {:?}", error);
    }

    /// Called when a child actor faults; the returned action decides the
    /// child's fate.
    async fn on_child_fault(
        &mut self,
        error: Error,
        _ctx: &mut ActorContext<A>,
    ) -> ChildAction {
        debug!("Handling child fault: {:?}", error);
        ChildAction::Stop
    }
}

/// A reference to a running actor.
///
/// Supports fire-and-forget sends (`tell`), request-response (`ask`),
/// graceful stop and event subscription. Cloning the reference clones the
/// channels, not the actor.
pub struct ActorRef<A>
where
    A: Actor + Handler<A>,
{
    path: ActorPath,
    sender: HandleHelper<A>,
    event_receiver: EventReceiver<<A as Actor>::Event>,
    stop_sender: StopSender,
}

impl<A> ActorRef<A>
where
    A: Actor + Handler<A>,
{
    /// Creates a new actor reference.
    pub fn new(
        path: ActorPath,
        sender: HandleHelper<A>,
        stop_sender: StopSender,
        event_receiver: EventReceiver<<A as Actor>::Event>,
    ) -> Self {
        Self {
            path,
            sender,
            stop_sender,
            event_receiver,
        }
    }

    /// Enqueues a message without waiting for a response. Enqueue order is
    /// the processing order.
    pub async fn tell(&self, message: A::Message) -> Result<(), Error> {
        self.sender.tell(self.path(), message).await
    }

    /// Enqueues a message and waits for the actor's response.
    pub async fn ask(&self, message: A::Message) -> Result<A::Response, Error> {
        self.sender.ask(self.path(), message).await
    }

    /// Requests the actor to stop and waits for the stop to complete.
    pub async fn ask_stop(&self) -> Result<(), Error> {
        debug!("Stopping actor {} from handle reference.", self.path);
        let (response_sender, response_receiver) = oneshot::channel();
        if self.stop_sender.send(Some(response_sender)).await.is_err() {
            Ok(())
        } else {
            Ok(response_receiver
                .await
                .map_err(|error| Error::Send(error.to_string()))?)
        }
    }

    /// Requests the actor to stop without waiting.
    pub async fn tell_stop(&self) {
        debug!("Stopping actor {} from handle reference.", self.path);
        let _ = self.stop_sender.send(None).await;
    }

    /// Returns the actor's path.
    pub fn path(&self) -> ActorPath {
        self.path.clone()
    }

    /// True if the actor's mailbox is closed.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Subscribes to the actor's event bus.
    pub fn subscribe(&self) -> EventReceiver<<A as Actor>::Event> {
        self.event_receiver.resubscribe()
    }
}

impl<A> Clone for ActorRef<A>
where
    A: Actor + Handler<A>,
{
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            sender: self.sender.clone(),
            stop_sender: self.stop_sender.clone(),
            event_receiver: self.event_receiver.resubscribe(),
        }
    }
}

impl<A> Debug for ActorRef<A>
where
    A: Actor + Handler<A>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::sink::{Sink, Subscriber};
    use crate::system::ActorSystem;

    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, Clone)]
    struct TestActor {
        counter: usize,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestMessage(usize);

    impl Message for TestMessage {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestResponse(usize);

    impl Response for TestResponse {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestEvent(usize);

    impl Event for TestEvent {}

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Event = TestEvent;
        type Response = TestResponse;
    }

    #[async_trait]
    impl Handler<TestActor> for TestActor {
        async fn handle_message(
            &mut self,
            _sender: ActorPath,
            msg: TestMessage,
            ctx: &mut ActorContext<TestActor>,
        ) -> Result<TestResponse, Error> {
            self.counter += msg.0;
            ctx.publish_event(TestEvent(self.counter)).await?;
            Ok(TestResponse(self.counter))
        }
    }

    pub struct TestSubscriber;

    #[async_trait]
    impl Subscriber<TestEvent> for TestSubscriber {
        async fn notify(&self, event: TestEvent) {
            debug!("Received event: {:?}", event);
            assert!(event.0 > 0);
        }
    }

    #[tokio::test]
    async fn test_actor() {
        let (system, _runner) = ActorSystem::create(CancellationToken::new());
        let actor = TestActor { counter: 0 };
        let actor_ref = system.create_root_actor("test", actor).await.unwrap();
        let sink = Sink::new(actor_ref.subscribe(), TestSubscriber);
        system.run_sink(sink).await;

        let mut recv = actor_ref.subscribe();
        actor_ref.tell(TestMessage(10)).await.unwrap();
        let response = actor_ref.ask(TestMessage(10)).await.unwrap();
        assert_eq!(response.0, 20);

        let event = recv.recv().await.unwrap();
        assert_eq!(event.0, 10);
        let event = recv.recv().await.unwrap();
        assert_eq!(event.0, 20);

        actor_ref.ask_stop().await.unwrap();
        assert!(
            system
                .get_actor::<TestActor>(&ActorPath::from("/user/test"))
                .await
                .is_none()
        );
    }
}
