//! The single construction path for every primitive.
//!
//! Each `create_*_state` takes an optional policy and returns either the real state or its inert
//! variant (never retries, never times out, always permits, unlimited, never applies), so callers
//! treat "configured" and "not configured" the same way.
//!
//! The factory holds the external services the states consume and no mutable state of its own.

use crate::async_bulkhead::AsyncBulkheadState;
use crate::bulkhead::{BulkheadPolicy, SyncBulkheadState};
use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerState};
use crate::clock::{Clock, MonotonicClock};
use crate::fallback::{FallbackPolicy, FallbackState};
use crate::retry::{RetryPolicy, RetryState};
use crate::runtime::{Executor, Scheduler, TokioRuntime};
use crate::telemetry::{MetricRecorder, NullRecorder};
use crate::timeout::{TimeoutPolicy, TimeoutState};
use std::fmt;
use std::sync::Arc;

/// Builds primitive states wired to a scheduler, executor, clock and metric recorder.
#[derive(Clone)]
pub struct FaultToleranceStateFactory {
    scheduler: Arc<dyn Scheduler>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn MetricRecorder>,
}

impl FaultToleranceStateFactory {
    /// Factory running timers and async work on `runtime`, with a monotonic clock and no metrics.
    pub fn new(runtime: TokioRuntime) -> Self {
        let runtime = Arc::new(runtime);
        Self {
            scheduler: runtime.clone(),
            executor: runtime,
            clock: Arc::new(MonotonicClock::default()),
            recorder: Arc::new(NullRecorder),
        }
    }

    /// Factory on the tokio runtime the caller is running on, if any.
    pub fn try_current() -> Option<Self> {
        TokioRuntime::try_current().map(Self::new)
    }

    pub fn with_scheduler<S: Scheduler + 'static>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn with_executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_recorder<M: MetricRecorder + 'static>(mut self, recorder: M) -> Self {
        self.recorder = Arc::new(recorder);
        self
    }

    pub fn recorder(&self) -> &Arc<dyn MetricRecorder> {
        &self.recorder
    }

    pub fn create_retry_state(&self, policy: Option<&RetryPolicy>) -> RetryState {
        match policy {
            Some(policy) => RetryState::new(policy.clone(), self.clock.clone(), self.recorder.clone()),
            None => RetryState::inert(),
        }
    }

    pub fn create_timeout_state(&self, policy: Option<&TimeoutPolicy>) -> TimeoutState {
        match policy {
            Some(policy) => {
                TimeoutState::new(*policy, self.scheduler.clone(), self.recorder.clone())
            }
            None => TimeoutState::inert(),
        }
    }

    pub fn create_circuit_breaker_state(
        &self,
        policy: Option<&CircuitBreakerPolicy>,
    ) -> CircuitBreakerState {
        match policy {
            Some(policy) => {
                CircuitBreakerState::new(policy.clone(), self.clock.clone(), self.recorder.clone())
            }
            None => CircuitBreakerState::inert(),
        }
    }

    pub fn create_sync_bulkhead_state(&self, policy: Option<&BulkheadPolicy>) -> SyncBulkheadState {
        match policy {
            Some(policy) => SyncBulkheadState::new(policy, self.recorder.clone()),
            None => SyncBulkheadState::inert(),
        }
    }

    pub fn create_async_bulkhead_state(
        &self,
        policy: Option<&BulkheadPolicy>,
    ) -> AsyncBulkheadState {
        match policy {
            Some(policy) => {
                AsyncBulkheadState::new(policy, self.executor.clone(), self.recorder.clone())
            }
            None => AsyncBulkheadState::inert(self.executor.clone(), self.recorder.clone()),
        }
    }

    pub fn create_fallback_state<R>(&self, policy: Option<&FallbackPolicy<R>>) -> FallbackState<R> {
        match policy {
            Some(policy) => FallbackState::new(policy.clone(), self.recorder.clone()),
            None => FallbackState::inert(),
        }
    }
}

impl fmt::Debug for FaultToleranceStateFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceStateFactory")
            .field("scheduler", &self.scheduler)
            .field("executor", &self.executor)
            .field("clock", &self.clock)
            .field("recorder", &self.recorder)
            .finish()
    }
}
