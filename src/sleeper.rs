//! Waiting out retry delays.
//!
//! `RetryState` only decides; the composed stack hands each scheduled pause to a `Sleeper`.
//! `InstantSleeper` and `TrackingSleeper` replace real waiting in tests.

use futures::future::{self, BoxFuture, FutureExt};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A pause the retry policy scheduled before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPause {
    /// Attempts made so far; the pause precedes attempt `completed + 1`.
    pub completed: u32,
    pub delay: Duration,
}

/// Waits out a [`RetryPause`].
pub trait Sleeper: Send + Sync + fmt::Debug {
    fn pause(&self, pause: RetryPause) -> BoxFuture<'static, ()>;
}

/// Waits on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn pause(&self, pause: RetryPause) -> BoxFuture<'static, ()> {
        tracing::debug!(
            next_attempt = pause.completed + 1,
            delay_ms = pause.delay.as_millis() as u64,
            "waiting before retry"
        );
        if pause.delay.is_zero() {
            return future::ready(()).boxed();
        }
        tokio::time::sleep(pause.delay).boxed()
    }
}

/// Retries immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn pause(&self, _pause: RetryPause) -> BoxFuture<'static, ()> {
        future::ready(()).boxed()
    }
}

/// Records every pause and retries immediately.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    pauses: Arc<Mutex<Vec<RetryPause>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pauses(&self) -> Vec<RetryPause> {
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Requested delays, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.pauses().into_iter().map(|pause| pause.delay).collect()
    }
}

impl Sleeper for TrackingSleeper {
    fn pause(&self, pause: RetryPause) -> BoxFuture<'static, ()> {
        self.pauses.lock().unwrap_or_else(PoisonError::into_inner).push(pause);
        future::ready(()).boxed()
    }
}
