// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Actor internal execution
//!
//! The [`ActorRunner`] owns one actor instance and drives its complete
//! lifecycle: startup, the select-based message loop, supervision and
//! termination. Each actor has exactly one runner; the runner processes the
//! mailbox strictly one message at a time, which is the system's sole
//! concurrency-safety mechanism.
//!

use crate::{
    ActorPath, Error,
    actor::{
        Actor, ActorContext, ActorLifecycle, ActorRef, ChildAction, ChildError,
        ChildErrorReceiver, ChildErrorSender, Handler,
    },
    handler::{HandleHelper, MailboxReceiver, mailbox},
    supervision::{RestartPolicy, RetryStrategy, SupervisionStrategy},
    system::SystemRef,
};

use tokio::{
    select,
    sync::{
        broadcast::{self, Sender as EventSender},
        mpsc, oneshot,
    },
};
use tracing::{debug, error, warn};

/// Channel sender for internal actor operations (events, errors, failures).
pub type InnerSender<A> = mpsc::UnboundedSender<InnerAction<A>>;

/// Channel receiver for internal actor operations.
pub type InnerReceiver<A> = mpsc::UnboundedReceiver<InnerAction<A>>;

/// Channel receiver for actor stop signals. Each signal optionally carries a
/// oneshot sender notified once the stop completes.
pub type StopReceiver = mpsc::Receiver<Option<oneshot::Sender<()>>>;

/// Channel sender for actor stop signals.
pub type StopSender = mpsc::Sender<Option<oneshot::Sender<()>>>;

/// Outcome of a supervision decision taken inside the message loop.
enum LoopAction {
    /// Keep processing messages.
    Continue,
    /// Initiate a graceful stop.
    Stop,
}

/// Core execution engine for a single actor.
pub(crate) struct ActorRunner<A: Actor> {
    /// Path identifying this actor within the system.
    path: ActorPath,
    /// The actor instance being executed.
    actor: A,
    /// Current lifecycle state.
    lifecycle: ActorLifecycle,
    /// Message receiver from the actor's mailbox.
    receiver: MailboxReceiver<A>,
    /// Event broadcasting sender.
    event_sender: EventSender<A::Event>,
    /// Receiver for stop signals.
    stop_receiver: StopReceiver,
    /// Error sender handed to child actors.
    error_sender: ChildErrorSender,
    /// Error sender towards the parent actor (`None` for root actors).
    parent_sender: Option<ChildErrorSender>,
    /// Receiver for child actor errors.
    error_receiver: ChildErrorReceiver,
    /// Internal action sender, cloned into the context.
    inner_sender: InnerSender<A>,
    /// Internal action receiver.
    inner_receiver: InnerReceiver<A>,
    /// Set once a stop signal has been issued.
    stop_signal: bool,
    /// Consecutive handler failures, reset on each successful message.
    handler_failures: usize,
}

impl<A> ActorRunner<A>
where
    A: Actor + Handler<A>,
{
    /// Creates a runner, the actor reference and the stop sender for a new
    /// actor.
    pub(crate) fn create(
        path: ActorPath,
        actor: A,
        parent_sender: Option<ChildErrorSender>,
    ) -> (Self, ActorRef<A>, StopSender) {
        debug!("Creating new actor runner.");
        let (sender, receiver) = mailbox();
        let (stop_sender, stop_receiver) = mpsc::channel(100);
        let (error_sender, error_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = broadcast::channel(10000);
        let (inner_sender, inner_receiver) = mpsc::unbounded_channel();
        let helper = HandleHelper::new(sender);

        let actor_ref = ActorRef::new(
            path.clone(),
            helper,
            stop_sender.clone(),
            event_receiver,
        );
        let runner: ActorRunner<A> = ActorRunner {
            path,
            actor,
            lifecycle: ActorLifecycle::Created,
            receiver,
            stop_receiver,
            event_sender,
            error_sender,
            parent_sender,
            error_receiver,
            inner_sender,
            inner_receiver,
            stop_signal: false,
            handler_failures: 0,
        };
        (runner, actor_ref, stop_sender)
    }

    /// Runs the actor's lifecycle state machine:
    /// Created → Started → (Restarted | Stopped | Failed) → Terminated.
    ///
    /// The optional `sender` is notified with `true` once the actor starts
    /// processing messages, or `false` if it terminates without starting.
    pub(crate) async fn init(
        &mut self,
        system: SystemRef,
        stop_sender: StopSender,
        mut sender: Option<oneshot::Sender<bool>>,
    ) {
        debug!("Initializing actor {} runner.", &self.path);

        let mut ctx: ActorContext<A> = ActorContext::new(
            stop_sender,
            self.path.clone(),
            system.clone(),
            self.error_sender.clone(),
            self.inner_sender.clone(),
        );

        let mut retries = 0;
        loop {
            match self.lifecycle {
                ActorLifecycle::Created => {
                    debug!("Actor {} is created.", &self.path);
                    match self.actor.pre_start(&mut ctx).await {
                        Ok(_) => {
                            debug!(
                                "Actor '{}' has started successfully.",
                                &self.path
                            );
                            self.lifecycle = ActorLifecycle::Started;
                        }
                        Err(err) => {
                            error!(
                                "Actor {} failed to start: {:?}",
                                &self.path, err
                            );
                            ctx.set_error(err);
                            self.lifecycle = ActorLifecycle::Failed;
                        }
                    }
                }
                ActorLifecycle::Started => {
                    debug!("Actor {} is started.", &self.path);
                    if let Some(sender) = sender.take() {
                        sender.send(true).unwrap_or_else(|err| {
                            error!("Failed to send signal: {:?}", err);
                        });
                    }
                    self.run(&mut ctx).await;
                }
                ActorLifecycle::Restarted => {
                    self.apply_supervision_strategy(
                        A::supervision_strategy(),
                        &mut ctx,
                        &mut retries,
                    )
                    .await;
                }
                ActorLifecycle::Stopped => {
                    debug!("Actor {} is stopped.", &self.path);
                    if self.actor.post_stop(&mut ctx).await.is_err() {
                        error!("Actor '{}' failed to stop!", &self.path);
                    }
                    self.lifecycle = ActorLifecycle::Terminated;
                }
                ActorLifecycle::Failed => {
                    debug!("Actor {} is faulty.", &self.path);
                    if self.parent_sender.is_none() {
                        self.lifecycle = ActorLifecycle::Restarted;
                    } else {
                        self.lifecycle = ActorLifecycle::Terminated;
                    }
                }
                ActorLifecycle::Terminated => {
                    debug!("Actor {} is terminated.", &self.path);
                    ctx.system().remove_actor(&self.path.clone()).await;
                    if let Some(sender) = sender.take() {
                        sender.send(false).unwrap_or_else(|err| {
                            error!("Failed to send signal: {:?}", err);
                        });
                    }
                    break;
                }
            }
        }
        self.receiver.close();
    }

    /// The main message loop. Waits concurrently on stop signals, child
    /// errors, internal actions and the mailbox, until a stop condition is
    /// met.
    pub(crate) async fn run(&mut self, ctx: &mut ActorContext<A>) {
        debug!("Running actor {}.", &self.path);

        loop {
            select! {
                stop = self.stop_receiver.recv() => {
                    debug!("Stopping actor {}.", &self.path);
                    if self.actor.pre_stop(ctx).await.is_err() {
                        error!("Failed to stop actor {}!", &self.path);
                    }

                    ctx.stop_childs().await;
                    ctx.remove_actor().await;

                    if let Some(Some(stop)) = stop {
                        let _ = stop.send(());
                    }

                    if let ActorLifecycle::Started = self.lifecycle {
                        self.lifecycle = ActorLifecycle::Stopped;
                    }
                    break;
                }
                error = self.error_receiver.recv(), if !self.stop_signal => {
                    if let Some(error) = error {
                        match error {
                            ChildError::Error { error } => {
                                self.actor.on_child_error(error, ctx).await
                            }
                            ChildError::Fault { error, sender } => {
                                let action = self
                                    .actor
                                    .on_child_fault(error, ctx)
                                    .await;
                                if sender.send(action).is_err() {
                                    error!("Can not send action to child!");
                                }
                            }
                        }
                    } else {
                        ctx.stop(None).await;
                        self.stop_signal = true;
                    }
                }
                recv = self.inner_receiver.recv(), if !self.stop_signal => {
                    if let Some(action) = recv {
                        self.inner_handle(action, ctx).await;
                    } else {
                        ctx.stop(None).await;
                        self.stop_signal = true;
                    }
                }
                msg = self.receiver.recv(), if !self.stop_signal => {
                    if let Some(mut msg) = msg {
                        msg.handle(&mut self.actor, ctx).await;
                        if let Some(failure) = ctx.take_handler_failure() {
                            if let LoopAction::Stop =
                                self.on_handler_failure(failure, ctx).await
                            {
                                ctx.stop(None).await;
                                self.stop_signal = true;
                            }
                        } else {
                            self.handler_failures = 0;
                        }
                    } else {
                        ctx.stop(None).await;
                        self.stop_signal = true;
                    }
                }
            }
        }
    }

    /// Applies the actor's restart policy after a failed message handler.
    ///
    /// `Resume` keeps the state untouched, `RestartClean` reinitializes the
    /// actor through `pre_restart`, `Stop` terminates. Once the consecutive
    /// failure count exceeds [`Actor::max_restarts`], the failure is
    /// escalated to the parent's `on_child_fault` regardless of the policy.
    async fn on_handler_failure(
        &mut self,
        failure: Error,
        ctx: &mut ActorContext<A>,
    ) -> LoopAction {
        self.handler_failures += 1;
        let budget_exhausted = self.handler_failures > A::max_restarts();

        if budget_exhausted {
            warn!(
                "Actor {} exceeded its restart budget ({}).",
                &self.path,
                A::max_restarts()
            );
            return self.escalate(failure, ctx).await;
        }

        match A::restart_policy() {
            RestartPolicy::Resume => {
                debug!(
                    "Actor {} resuming after handler failure: {}",
                    &self.path, failure
                );
                LoopAction::Continue
            }
            RestartPolicy::RestartClean => {
                debug!(
                    "Actor {} restarting after handler failure: {}",
                    &self.path, failure
                );
                match ctx.restart(&mut self.actor, Some(&failure)).await {
                    Ok(_) => LoopAction::Continue,
                    Err(err) => {
                        error!(
                            "Actor {} failed to restart: {}",
                            &self.path, err
                        );
                        ctx.set_error(err);
                        LoopAction::Stop
                    }
                }
            }
            RestartPolicy::Stop => self.escalate(failure, ctx).await,
        }
    }

    /// Escalates a failure to the parent actor and applies its decision.
    /// Root actors stop.
    async fn escalate(
        &mut self,
        failure: Error,
        ctx: &mut ActorContext<A>,
    ) -> LoopAction {
        let Some(parent) = self.parent_sender.as_ref() else {
            return LoopAction::Stop;
        };
        let (action_sender, action_receiver) = oneshot::channel();
        if parent
            .send(ChildError::Fault {
                error: failure.clone(),
                sender: action_sender,
            })
            .is_err()
        {
            error!("Failed to send fault to parent actor.");
            return LoopAction::Stop;
        }
        match action_receiver.await {
            Ok(ChildAction::Stop) | Err(_) => LoopAction::Stop,
            Ok(ChildAction::Restart) | Ok(ChildAction::Delegate) => {
                self.handler_failures = 0;
                match ctx.restart(&mut self.actor, Some(&failure)).await {
                    Ok(_) => LoopAction::Continue,
                    Err(err) => {
                        ctx.set_error(err);
                        LoopAction::Stop
                    }
                }
            }
        }
    }

    /// Processes internal actions generated by the actor through its
    /// context: event publication, error reports and failure notifications.
    async fn inner_handle(
        &mut self,
        action: InnerAction<A>,
        ctx: &mut ActorContext<A>,
    ) {
        match action {
            InnerAction::Event(event) => {
                match self.event_sender.send(event.clone()) {
                    Ok(size) => {
                        debug!(
                            "Event sent successfully to {} subscribers.",
                            size
                        );
                    }
                    Err(_err) => {
                        debug!("No subscribers for event.");
                    }
                }
                self.actor.on_event(event, ctx).await;
            }
            InnerAction::Error(error) => {
                if let Some(parent_helper) = self.parent_sender.as_mut() {
                    parent_helper
                        .send(ChildError::Error { error })
                        .unwrap_or_else(|err| {
                            error!(
                                "Failed to send error to parent actor: {:?}",
                                err
                            );
                        });
                }
            }
            InnerAction::Fail(error) => {
                ctx.clean_error();
                if let LoopAction::Stop = self.escalate(error, ctx).await {
                    ctx.stop(None).await;
                    self.stop_signal = true;
                }
            }
        }
    }

    /// Applies the configured supervision strategy after a start failure,
    /// retrying with the strategy's backoff schedule until it succeeds or
    /// the retry budget is exhausted.
    async fn apply_supervision_strategy(
        &mut self,
        strategy: SupervisionStrategy,
        ctx: &mut ActorContext<A>,
        retries: &mut usize,
    ) {
        match strategy {
            SupervisionStrategy::Stop => {
                error!("Actor '{}' failed to start!", &self.path);
                self.lifecycle = ActorLifecycle::Stopped;
            }
            SupervisionStrategy::Retry(mut retry_strategy) => {
                debug!(
                    "Restarting actor with retry strategy: {:?}",
                    &retry_strategy
                );
                if *retries < retry_strategy.max_retries() {
                    debug!("retries: {}", &retries);
                    if let Some(duration) = retry_strategy.next_backoff() {
                        debug!("Backoff for {:?}", &duration);
                        tokio::time::sleep(duration).await;
                    }
                    *retries += 1;
                    let error = ctx.error();
                    match ctx.restart(&mut self.actor, error.as_ref()).await {
                        Ok(_) => {
                            ctx.clean_error();
                            self.lifecycle = ActorLifecycle::Started;
                            *retries = 0;
                        }
                        Err(err) => {
                            ctx.set_error(err);
                        }
                    }
                } else {
                    self.lifecycle = ActorLifecycle::Stopped;
                }
            }
        }
    }
}

/// Internal actions an actor can generate through its execution context.
/// They are processed by the runner with priority over regular messages.
#[derive(Debug, Clone)]
pub enum InnerAction<A: Actor> {
    /// An event to broadcast to subscribers.
    Event(A::Event),
    /// A non-fatal error reported to the parent for visibility.
    Error(Error),
    /// A fatal failure requiring a supervision decision.
    Fail(Error),
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::{
        Error,
        actor::{Actor, ActorContext, Event, Handler, Message},
        supervision::{FixedIntervalStrategy, Strategy, SupervisionStrategy},
        system::ActorSystem,
    };
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TestMessage(ErrorMessage);

    impl Message for TestMessage {}

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub enum ErrorMessage {
        Fail,
        Stop,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TestEvent;

    impl Event for TestEvent {}

    #[derive(Debug, Clone)]
    pub struct TestActor {
        failed: bool,
        handled: usize,
    }

    #[async_trait]
    impl Actor for TestActor {
        type Message = TestMessage;
        type Response = ();
        type Event = TestEvent;

        fn supervision_strategy() -> SupervisionStrategy {
            SupervisionStrategy::Retry(Strategy::FixedInterval(
                FixedIntervalStrategy::new(3, Duration::from_millis(100)),
            ))
        }

        fn max_restarts() -> usize {
            1
        }

        async fn pre_start(
            &mut self,
            _ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            if self.failed {
                Err(Error::Start("PreStart failed".to_owned()))
            } else {
                Ok(())
            }
        }

        async fn pre_restart(
            &mut self,
            _ctx: &mut ActorContext<Self>,
            _error: Option<&Error>,
        ) -> Result<(), Error> {
            if self.failed {
                self.failed = false;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Handler<TestActor> for TestActor {
        async fn handle_message(
            &mut self,
            _sender: ActorPath,
            msg: TestMessage,
            ctx: &mut ActorContext<Self>,
        ) -> Result<(), Error> {
            match msg {
                TestMessage(ErrorMessage::Fail) => {
                    Err(Error::Handler("boom".to_owned()))
                }
                TestMessage(ErrorMessage::Stop) => {
                    self.handled += 1;
                    ctx.stop(None).await;
                    Ok(())
                }
            }
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_actor_start_retry() {
        let (system, _runner) = ActorSystem::create(CancellationToken::new());

        let actor = TestActor {
            failed: true,
            handled: 0,
        };
        let actor_ref = system
            .create_root_actor("test", actor)
            .await
            .expect("actor should start after retry");

        actor_ref
            .tell(TestMessage(ErrorMessage::Stop))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(logs_contain("Actor /user/test failed to start"));
        assert!(logs_contain("Restarting actor with retry strategy"));
        assert!(logs_contain("Actor /user/test is terminated"));
        assert!(
            system
                .get_actor::<TestActor>(&ActorPath::from("/user/test"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handler_failure_resumes_within_budget() {
        let (system, _runner) = ActorSystem::create(CancellationToken::new());

        let actor = TestActor {
            failed: false,
            handled: 0,
        };
        let actor_ref =
            system.create_root_actor("resumable", actor).await.unwrap();

        // First failure is within the budget (max_restarts = 1): the actor
        // resumes and keeps processing.
        let result = actor_ref.ask(TestMessage(ErrorMessage::Fail)).await;
        assert!(result.is_err());
        actor_ref
            .tell(TestMessage(ErrorMessage::Stop))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            system
                .get_actor::<TestActor>(&ActorPath::from("/user/resumable"))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_handler_failure_budget_exhausted_stops_root() {
        let (system, _runner) = ActorSystem::create(CancellationToken::new());

        let actor = TestActor {
            failed: false,
            handled: 0,
        };
        let actor_ref =
            system.create_root_actor("crashing", actor).await.unwrap();

        // Two consecutive failures exceed max_restarts = 1 and stop the
        // actor.
        let _ = actor_ref.ask(TestMessage(ErrorMessage::Fail)).await;
        let _ = actor_ref.ask(TestMessage(ErrorMessage::Fail)).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(logs_contain("exceeded its restart budget"));
        assert!(
            system
                .get_actor::<TestActor>(&ActorPath::from("/user/crashing"))
                .await
                .is_none()
        );
    }
}
