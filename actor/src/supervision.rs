// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! # Supervision
//!
//! Strategies applied when an actor fails. Start failures are governed by a
//! [`SupervisionStrategy`] (stop, or retry the startup with a backoff
//! schedule). Failures raised from a message handler are governed by a
//! [`RestartPolicy`], which decides what happens to the actor's state.
//!

use std::{fmt::Debug, time::Duration};

use backoff::backoff::Backoff as InnerBackoff;

/// What to do with an actor whose message handler returned an error.
///
/// The policy decides the fate of the actor's in-memory state; the hosting
/// parent decides the fate of the actor itself once the restart budget
/// ([`crate::Actor::max_restarts`]) is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Keep the state as it was and continue with the next message.
    Resume,
    /// Reinitialize the actor through `pre_restart` before continuing.
    RestartClean,
    /// Stop the actor on the first handler failure.
    Stop,
}

/// Trait to define a retry strategy. Implement it to provide a custom
/// retry schedule for actor startup.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Maximum number of tries before permanently failing an actor.
    fn max_retries(&self) -> usize;
    /// Wait duration before retrying.
    fn next_backoff(&mut self) -> Option<Duration>;
}

/// A supervision strategy defines what to do when an actor fails at
/// startup: stop it, or retry the startup following a [`Strategy`].
#[derive(Debug)]
pub enum SupervisionStrategy {
    /// Stop the actor if an error occurs at startup.
    Stop,
    /// Retry starting the actor if an error occurs at startup.
    Retry(Strategy),
}

/// Available retry schedules.
#[derive(Debug)]
pub enum Strategy {
    /// Retry immediately, without delay.
    NoInterval(NoIntervalStrategy),
    /// Retry with a fixed wait period between attempts.
    FixedInterval(FixedIntervalStrategy),
    /// Retry with an exponential backoff wait period.
    ExponentialBackoff(ExponentialBackoffStrategy),
}

impl RetryStrategy for Strategy {
    fn max_retries(&self) -> usize {
        match self {
            Strategy::NoInterval(s) => s.max_retries(),
            Strategy::FixedInterval(s) => s.max_retries(),
            Strategy::ExponentialBackoff(s) => s.max_retries(),
        }
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        match self {
            Strategy::NoInterval(s) => s.next_backoff(),
            Strategy::FixedInterval(s) => s.next_backoff(),
            Strategy::ExponentialBackoff(s) => s.next_backoff(),
        }
    }
}

/// A retry strategy that immediately retries an actor that failed to start.
#[derive(Debug, Default)]
pub struct NoIntervalStrategy {
    max_retries: usize,
}

impl NoIntervalStrategy {
    pub fn new(max_retries: usize) -> Self {
        NoIntervalStrategy { max_retries }
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// A retry strategy that retries an actor with a fixed wait period before
/// retrying.
#[derive(Debug, Default)]
pub struct FixedIntervalStrategy {
    /// Maximum number of retries before permanently failing an actor.
    max_retries: usize,
    /// Wait duration before retrying.
    duration: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: usize, duration: Duration) -> Self {
        FixedIntervalStrategy {
            max_retries,
            duration,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.duration)
    }
}

/// A retry strategy that retries an actor with an exponential backoff wait
/// period before retrying.
#[derive(Debug, Default)]
pub struct ExponentialBackoffStrategy {
    /// Maximum number of retries before permanently failing an actor.
    max_retries: usize,
    /// Inner exponential backoff schedule.
    inner: backoff::ExponentialBackoff,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: usize) -> Self {
        ExponentialBackoffStrategy {
            max_retries,
            inner: backoff::ExponentialBackoff::default(),
        }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.inner.next_backoff()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_no_interval_strategy() {
        let mut strategy = NoIntervalStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_fixed_interval_strategy() {
        let mut strategy =
            FixedIntervalStrategy::new(3, Duration::from_secs(1));
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_backoff_strategy() {
        let mut strategy = ExponentialBackoffStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert!(strategy.next_backoff().is_some());
    }

    #[test]
    fn test_strategy_dispatch() {
        let mut strategy = Strategy::FixedInterval(FixedIntervalStrategy::new(
            5,
            Duration::from_millis(20),
        ));
        assert_eq!(strategy.max_retries(), 5);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_millis(20)));
    }
}
