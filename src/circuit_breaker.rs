//! Circuit breaker over a rolling window of recent outcomes.
//!
//! State machine:
//! - `Closed`: every request is admitted. Outcomes go into a window holding the last
//!   `request_volume_threshold` results. Once the window is full and
//!   `failures / window >= failure_ratio`, the breaker opens.
//! - `Open`: requests are refused until `delay` has elapsed. The first permission check after
//!   that moves the breaker to `HalfOpen`. Results reported while open are ignored.
//! - `HalfOpen`: at most `success_threshold` trials run at once. `success_threshold` trial
//!   successes close the breaker; any trial failure reopens it for another `delay`.
//!
//! The window and trial counters sit behind one mutex, so admission and recording are
//! linearizable and half-open admission cannot over-admit under contention.
//!
//! Every admission is a [`CircuitPermit`] tagged with the generation of the state that issued it;
//! each transition starts a new generation. A result is only counted by the generation that
//! admitted it, so a slow call admitted while closed can neither fill a trial slot nor close the
//! breaker. A trial permit dropped without a result (the caller was cancelled) frees its slot.
//!
//! Failures matching `skip_on` count as successes; `skip_on` wins over `fail_on`. Failures
//! matching neither also count as successes.

use crate::classify::ErrorClassSet;
use crate::clock::Clock;
use crate::error::{PolicyError, ResilienceError};
use crate::result::MethodResult;
use crate::telemetry::{CircuitBreakerEvent, MetricRecorder, PolicyEvent};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open period elapses.
    Open,
    /// Probe mode allowing a limited number of trial calls.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    /// Failures currently in the rolling window.
    pub failures: usize,
    /// Outcomes currently in the rolling window.
    pub window: usize,
}

/// Immutable circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    request_volume_threshold: usize,
    failure_ratio: f64,
    delay: Duration,
    success_threshold: usize,
    fail_on: ErrorClassSet,
    skip_on: ErrorClassSet,
}

impl CircuitBreakerPolicy {
    pub fn builder() -> CircuitBreakerPolicyBuilder {
        CircuitBreakerPolicyBuilder::new()
    }

    pub fn request_volume_threshold(&self) -> usize {
        self.request_volume_threshold
    }

    pub fn failure_ratio(&self) -> f64 {
        self.failure_ratio
    }

    /// How long the breaker stays open.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    pub fn fail_on(&self) -> &ErrorClassSet {
        &self.fail_on
    }

    pub fn skip_on(&self) -> &ErrorClassSet {
        &self.skip_on
    }

    fn is_failure<R>(&self, result: &MethodResult<R>) -> bool {
        match result {
            MethodResult::Success(_) => false,
            MethodResult::Failure(err) => {
                !self.skip_on.matches(&**err) && self.fail_on.matches(&**err)
            }
        }
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        CircuitBreakerPolicyBuilder::new().into_policy()
    }
}

/// Builder for [`CircuitBreakerPolicy`].
///
/// Defaults: window of 20, failure ratio 0.5, 5s open period, 1 trial success to close,
/// every failure counts.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicyBuilder {
    request_volume_threshold: usize,
    failure_ratio: f64,
    delay: Duration,
    success_threshold: usize,
    fail_on: ErrorClassSet,
    skip_on: ErrorClassSet,
}

impl CircuitBreakerPolicyBuilder {
    pub fn new() -> Self {
        Self {
            request_volume_threshold: 20,
            failure_ratio: 0.5,
            delay: Duration::from_secs(5),
            success_threshold: 1,
            fail_on: ErrorClassSet::any(),
            skip_on: ErrorClassSet::empty(),
        }
    }

    /// Size of the rolling window; the breaker never trips before it is full.
    pub fn request_volume_threshold(mut self, volume: usize) -> Self {
        self.request_volume_threshold = volume;
        self
    }

    pub fn failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn success_threshold(mut self, successes: usize) -> Self {
        self.success_threshold = successes;
        self
    }

    /// Failures that count against the circuit. Replaces the default "any".
    pub fn fail_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.fail_on = classes.into();
        self
    }

    /// Failures recorded as successes, even when they also match `fail_on`.
    pub fn skip_on(mut self, classes: impl Into<ErrorClassSet>) -> Self {
        self.skip_on = classes.into();
        self
    }

    pub fn build(self) -> Result<CircuitBreakerPolicy, PolicyError> {
        if self.request_volume_threshold == 0 {
            return Err(PolicyError::InvalidRequestVolume(0));
        }
        if !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(PolicyError::InvalidFailureRatio(self.failure_ratio));
        }
        if self.success_threshold == 0 {
            return Err(PolicyError::InvalidSuccessThreshold(0));
        }
        Ok(self.into_policy())
    }

    fn into_policy(self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy {
            request_volume_threshold: self.request_volume_threshold,
            failure_ratio: self.failure_ratio,
            delay: self.delay,
            success_threshold: self.success_threshold,
            fail_on: self.fail_on,
            skip_on: self.skip_on,
        }
    }
}

impl Default for CircuitBreakerPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Long-lived breaker shared by every invocation of one guarded method.
///
/// Clones share state.
#[derive(Clone)]
pub struct CircuitBreakerState {
    kind: BreakerKind,
}

#[derive(Clone)]
enum BreakerKind {
    Active(Arc<Breaker>),
    Inert,
}

struct Breaker {
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn MetricRecorder>,
    core: Mutex<Core>,
}

struct Core {
    state: CircuitState,
    generation: u64,
    /// `true` marks a failure.
    window: VecDeque<bool>,
    failures: usize,
    open_until: u64,
    trials_in_flight: usize,
    trial_successes: usize,
}

impl Core {
    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
        self.trials_in_flight = 0;
        self.trial_successes = 0;
    }

    fn push_outcome(&mut self, failure: bool, capacity: usize) {
        if self.window.len() == capacity {
            if let Some(true) = self.window.pop_front() {
                self.failures -= 1;
            }
        }
        self.window.push_back(failure);
        if failure {
            self.failures += 1;
        }
    }

    fn clear_window(&mut self) {
        self.window.clear();
        self.failures = 0;
    }
}

impl CircuitBreakerState {
    pub(crate) fn new(
        policy: CircuitBreakerPolicy,
        clock: Arc<dyn Clock>,
        recorder: Arc<dyn MetricRecorder>,
    ) -> Self {
        let core = Core {
            state: CircuitState::Closed,
            generation: 0,
            window: VecDeque::with_capacity(policy.request_volume_threshold),
            failures: 0,
            open_until: 0,
            trials_in_flight: 0,
            trial_successes: 0,
        };
        let breaker = Breaker { policy, clock, recorder, core: Mutex::new(core) };
        Self { kind: BreakerKind::Active(Arc::new(breaker)) }
    }

    pub(crate) fn inert() -> Self {
        Self { kind: BreakerKind::Inert }
    }

    /// Ask whether an attempt may run now; `None` means refused.
    ///
    /// The permit goes back through [`record_result`](Self::record_result). A half-open trial
    /// holds its trial slot until then, or until the permit is dropped.
    pub fn request_permission(&self) -> Option<CircuitPermit> {
        let BreakerKind::Active(breaker) = &self.kind else {
            return Some(CircuitPermit { breaker: None, generation: 0, trial: false });
        };
        let mut core = breaker.lock();
        if core.state == CircuitState::Open {
            if breaker.clock.now_millis() < core.open_until {
                drop(core);
                breaker.recorder.record(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Rejected));
                return None;
            }
            core.enter(CircuitState::HalfOpen);
            tracing::info!("Circuit breaker → half-open");
            breaker.recorder.record(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::HalfOpen));
        }

        let trial = core.state == CircuitState::HalfOpen;
        if trial {
            let limit = breaker.policy.success_threshold;
            if core.trials_in_flight >= limit {
                drop(core);
                breaker.recorder.record(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Rejected));
                return None;
            }
            core.trials_in_flight += 1;
            tracing::debug!(
                in_flight = core.trials_in_flight,
                max = limit,
                "Circuit breaker: half-open trial admitted"
            );
        }
        Some(CircuitPermit { breaker: Some(breaker.clone()), generation: core.generation, trial })
    }

    /// Record the outcome of the attempt `permit` admitted.
    ///
    /// Ignored when the breaker has changed state since the permit was issued, or when the
    /// permit came from another breaker.
    pub fn record_result<R>(&self, mut permit: CircuitPermit, result: &MethodResult<R>) {
        let BreakerKind::Active(breaker) = &self.kind else {
            return;
        };
        if !permit.issued_by(breaker) {
            return;
        }
        permit.trial = false;
        let failure = breaker.policy.is_failure(result);
        let mut core = breaker.lock();
        if core.generation != permit.generation {
            tracing::trace!(state = %core.state, "Circuit breaker: stale result ignored");
            return;
        }
        match core.state {
            CircuitState::Closed => {
                let capacity = breaker.policy.request_volume_threshold;
                core.push_outcome(failure, capacity);
                let window = core.window.len();
                let failures = core.failures;
                if window == capacity
                    && failures > 0
                    && failures as f64 / window as f64 >= breaker.policy.failure_ratio
                {
                    tracing::error!(
                        failures,
                        window,
                        ratio = breaker.policy.failure_ratio,
                        "Circuit breaker → open"
                    );
                    breaker.open(&mut core);
                    drop(core);
                    breaker.recorder.record(&PolicyEvent::CircuitBreaker(
                        CircuitBreakerEvent::Opened { failures, window },
                    ));
                }
            }
            CircuitState::HalfOpen => {
                core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
                if failure {
                    tracing::warn!("Circuit breaker: trial failed → open");
                    breaker.open(&mut core);
                    drop(core);
                    breaker.recorder.record(&PolicyEvent::CircuitBreaker(
                        CircuitBreakerEvent::Opened { failures: 1, window: 1 },
                    ));
                    return;
                }
                core.trial_successes += 1;
                if core.trial_successes >= breaker.policy.success_threshold {
                    core.enter(CircuitState::Closed);
                    core.clear_window();
                    tracing::info!("Circuit breaker → closed");
                    drop(core);
                    breaker
                        .recorder
                        .record(&PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Closed));
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Stored state; an expired open period is only noticed by the next permission check.
    pub fn state(&self) -> CircuitState {
        match &self.kind {
            BreakerKind::Active(breaker) => breaker.lock().state,
            BreakerKind::Inert => CircuitState::Closed,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        match &self.kind {
            BreakerKind::Active(breaker) => {
                let core = breaker.lock();
                CircuitSnapshot { state: core.state, failures: core.failures, window: core.window.len() }
            }
            BreakerKind::Inert => {
                CircuitSnapshot { state: CircuitState::Closed, failures: 0, window: 0 }
            }
        }
    }

    /// Force the breaker closed with an empty window.
    pub fn reset(&self) {
        if let BreakerKind::Active(breaker) = &self.kind {
            let mut core = breaker.lock();
            core.enter(CircuitState::Closed);
            core.open_until = 0;
            core.clear_window();
            tracing::info!("Circuit breaker reset → closed");
        }
    }

    /// Error reported to a caller refused by [`request_permission`](Self::request_permission).
    pub fn rejection(&self) -> ResilienceError {
        let remaining = match &self.kind {
            BreakerKind::Active(breaker) => {
                let open_until = breaker.lock().open_until;
                Duration::from_millis(open_until.saturating_sub(breaker.clock.now_millis()))
            }
            BreakerKind::Inert => Duration::ZERO,
        };
        ResilienceError::CircuitOpen { remaining }
    }

    /// False for the inert variant built when no breaker policy is configured.
    pub fn is_active(&self) -> bool {
        matches!(self.kind, BreakerKind::Active(_))
    }
}

impl Breaker {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, core: &mut Core) {
        core.enter(CircuitState::Open);
        core.open_until = self.clock.now_millis().saturating_add(millis(self.policy.delay));
        core.clear_window();
    }

    fn abandon_trial(&self, generation: u64) {
        let mut core = self.lock();
        if core.state == CircuitState::HalfOpen && core.generation == generation {
            core.trials_in_flight = core.trials_in_flight.saturating_sub(1);
            tracing::debug!(
                in_flight = core.trials_in_flight,
                "Circuit breaker: half-open trial abandoned"
            );
        }
    }
}

/// One admission granted by [`CircuitBreakerState::request_permission`].
#[must_use = "hand the permit back through `record_result`"]
pub struct CircuitPermit {
    /// `None` for permits from the inert breaker.
    breaker: Option<Arc<Breaker>>,
    generation: u64,
    /// Holds a half-open trial slot until recorded or dropped.
    trial: bool,
}

impl CircuitPermit {
    fn issued_by(&self, breaker: &Arc<Breaker>) -> bool {
        self.breaker.as_ref().is_some_and(|issuer| Arc::ptr_eq(issuer, breaker))
    }

    /// Whether this permit occupies a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial {
            if let Some(breaker) = &self.breaker {
                breaker.abandon_trial(self.generation);
            }
        }
    }
}

impl fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("generation", &self.generation)
            .field("trial", &self.trial)
            .finish()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            BreakerKind::Active(_) => f
                .debug_struct("CircuitBreakerState")
                .field("snapshot", &self.snapshot())
                .finish(),
            BreakerKind::Inert => f.write_str("CircuitBreakerState(inert)"),
        }
    }
}
