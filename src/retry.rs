//! Retry decisions for one guarded invocation.
//!
//! Semantics:
//! - `max_retries` counts retries after the initial attempt, so `max_retries = n` allows at most
//!   `n + 1` attempts. `None` means unlimited.
//! - A failure is checked against `abort_on` first; a match stops retrying even when the same
//!   error is also in `retry_on`. An empty `retry_on` retries nothing.
//! - The delay before the next attempt comes from the `Backoff` (constant `delay` by default),
//!   then `Jitter`, and is clamped to the time left before `max_duration`.
//! - `RetryState` only decides; the caller waits out the returned delay (see `Sleeper`).
//!
//! Example
//! ```rust
//! use lifeline::{MethodResult, RetryCategory, RetryPolicy, FaultToleranceStateFactory};
//! use std::io;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let factory = FaultToleranceStateFactory::try_current().unwrap();
//! let policy = RetryPolicy::builder().max_retries(1).build().unwrap();
//! let mut retry = factory.create_retry_state(Some(&policy));
//! retry.start();
//!
//! let failed: MethodResult<()> = MethodResult::failure(io::Error::other("flaky"));
//! assert!(retry.record_result(&failed).should_retry());
//! assert_eq!(retry.record_result(&failed).category(), RetryCategory::MaxRetriesReached);
//! # }
//! ```

use crate::backoff::Backoff;
use crate::classify::ErrorClassSet;
use crate::clock::Clock;
use crate::error::PolicyError;
use crate::jitter::Jitter;
use crate::result::MethodResult;
use crate::telemetry::{MetricRecorder, PolicyEvent, RetryEvent};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a retry decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCategory {
    /// Another attempt should follow.
    Retry,
    /// The retry budget is spent.
    MaxRetriesReached,
    /// The invocation ran past `max_duration`.
    MaxDurationReached,
    /// The attempt succeeded (or retry is not configured).
    NoRetry,
    /// The failure is not in `retry_on`.
    ResultNotRetryable,
    /// The failure is in `abort_on`.
    ResultInAbortOn,
}

impl RetryCategory {
    /// True for the categories that end a loop on a limit rather than on the outcome itself.
    pub fn is_limit(&self) -> bool {
        matches!(self, RetryCategory::MaxRetriesReached | RetryCategory::MaxDurationReached)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryCategory::Retry => "retry",
            RetryCategory::MaxRetriesReached => "max retries reached",
            RetryCategory::MaxDurationReached => "max duration reached",
            RetryCategory::NoRetry => "no retry",
            RetryCategory::ResultNotRetryable => "result not retryable",
            RetryCategory::ResultInAbortOn => "result in abort_on",
        };
        f.write_str(name)
    }
}

/// Outcome of [`RetryState::record_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryResult {
    should_retry: bool,
    delay: Duration,
    category: RetryCategory,
}

impl RetryResult {
    fn stop(category: RetryCategory) -> Self {
        Self { should_retry: false, delay: Duration::ZERO, category }
    }

    fn retry_after(delay: Duration) -> Self {
        Self { should_retry: true, delay, category: RetryCategory::Retry }
    }

    pub fn should_retry(&self) -> bool {
        self.should_retry
    }

    /// Time to wait before the next attempt; zero when not retrying.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn category(&self) -> RetryCategory {
        self.category
    }
}

/// Immutable retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: Option<u32>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: ErrorClassSet,
    abort_on: ErrorClassSet,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Retries allowed after the first attempt; `None` is unlimited.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Overall time budget measured from `start`; `None` is unbounded.
    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn retry_on(&self) -> &ErrorClassSet {
        &self.retry_on
    }

    pub fn abort_on(&self) -> &ErrorClassSet {
        &self.abort_on
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().into_policy()
    }
}

/// Builder for [`RetryPolicy`].
///
/// Defaults: 3 retries, no delay, 180s max duration, 200ms jitter, retry on any error.
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    max_duration: Option<Duration>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: ErrorClassSet,
    abort_on: ErrorClassSet,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_retries: Some(3),
            max_duration: Some(Duration::from_secs(180)),
            backoff: Backoff::default(),
            jitter: Jitter::bounded(Duration::from_millis(200)),
            retry_on: ErrorClassSet::any(),
            abort_on: ErrorClassSet::empty(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn unlimited_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    pub fn max_duration(mut self, max: Duration) -> Self {
        self.max_duration = Some(max);
        self
    }

    pub fn no_max_duration(mut self) -> Self {
        self.max_duration = None;
        self
    }

    /// Constant delay between attempts. Replaces any backoff set earlier.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::constant(delay);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Failures worth retrying. Replaces the default "any".
    pub fn retry_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.retry_on = classes.into();
        self
    }

    /// Failures that stop retrying immediately; checked before `retry_on`.
    pub fn abort_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.abort_on = classes.into();
        self
    }

    /// Build the policy, rejecting a base delay that does not fit inside `max_duration`.
    pub fn build(self) -> Result<RetryPolicy, PolicyError> {
        if let Some(max_duration) = self.max_duration {
            let delay = self.backoff.delay(1);
            if delay >= max_duration {
                return Err(PolicyError::DelayExceedsMaxDuration { delay, max_duration });
            }
        }
        Ok(self.into_policy())
    }

    fn into_policy(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            max_duration: self.max_duration,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_on: self.retry_on,
            abort_on: self.abort_on,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-invocation retry bookkeeping. Build one through the factory for every guarded call.
#[derive(Debug)]
pub struct RetryState {
    kind: RetryKind,
    attempts: u32,
}

#[derive(Debug)]
enum RetryKind {
    Active(ActiveRetry),
    Inert,
}

#[derive(Debug)]
struct ActiveRetry {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn MetricRecorder>,
    started_at: Option<u64>,
    last_delay: Duration,
}

impl RetryState {
    pub(crate) fn new(
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn MetricRecorder>,
    ) -> Self {
        let active =
            ActiveRetry { policy, clock, recorder, started_at: None, last_delay: Duration::ZERO };
        Self { kind: RetryKind::Active(active), attempts: 0 }
    }

    pub(crate) fn inert() -> Self {
        Self { kind: RetryKind::Inert, attempts: 0 }
    }

    /// Mark the beginning of the invocation; `max_duration` is measured from here.
    ///
    /// Recording a result without `start` starts the clock at that first result.
    pub fn start(&mut self) {
        if let RetryKind::Active(active) = &mut self.kind {
            active.started_at = Some(active.clock.now_millis());
        }
    }

    /// Record the outcome of one attempt and decide whether another should follow.
    pub fn record_result<R>(&mut self, result: &MethodResult<R>) -> RetryResult {
        self.attempts = self.attempts.saturating_add(1);
        let attempts = self.attempts;
        let active = match &mut self.kind {
            RetryKind::Active(active) => active,
            RetryKind::Inert => return RetryResult::stop(RetryCategory::NoRetry),
        };

        let decision = active.decide(attempts, result);
        let event = if decision.should_retry {
            tracing::debug!(attempt = attempts, delay = ?decision.delay, "retrying");
            RetryEvent::Scheduled { attempt: attempts, delay: decision.delay }
        } else {
            tracing::debug!(attempts, category = %decision.category, "retry loop finished");
            RetryEvent::Finished { attempts, category: decision.category }
        };
        active.recorder.record(&PolicyEvent::Retry(event));
        decision
    }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay handed out by the most recent `Retry` decision.
    pub fn last_delay(&self) -> Duration {
        match &self.kind {
            RetryKind::Active(active) => active.last_delay,
            RetryKind::Inert => Duration::ZERO,
        }
    }

    /// False for the inert variant built when no retry policy is configured.
    pub fn is_active(&self) -> bool {
        matches!(self.kind, RetryKind::Active(_))
    }
}

impl ActiveRetry {
    fn decide<R>(&mut self, attempts: u32, result: &MethodResult<R>) -> RetryResult {
        let now = self.clock.now_millis();
        let started_at = *self.started_at.get_or_insert(now);

        let err = match result {
            MethodResult::Success(_) => return RetryResult::stop(RetryCategory::NoRetry),
            MethodResult::Failure(err) => err,
        };
        if self.policy.abort_on.matches(&**err) {
            return RetryResult::stop(RetryCategory::ResultInAbortOn);
        }
        if !self.policy.retry_on.matches(&**err) {
            return RetryResult::stop(RetryCategory::ResultNotRetryable);
        }
        if let Some(max_retries) = self.policy.max_retries {
            if attempts - 1 >= max_retries {
                return RetryResult::stop(RetryCategory::MaxRetriesReached);
            }
        }

        let elapsed = Duration::from_millis(now.saturating_sub(started_at));
        let mut delay = self.policy.jitter.apply(self.policy.backoff.delay(attempts));
        if let Some(max_duration) = self.policy.max_duration {
            if elapsed >= max_duration {
                return RetryResult::stop(RetryCategory::MaxDurationReached);
            }
            delay = delay.min(max_duration - elapsed);
        }

        self.last_delay = delay;
        RetryResult::retry_after(delay)
    }
}
