//! Composed fault tolerance for one guarded async method.
//!
//! Order, outermost first: Fallback → Retry loop → Circuit breaker → Timeout → Bulkhead → call.
//! Every attempt asks the breaker for permission, runs against a fresh deadline inside the
//! bulkhead, and is recorded to the breaker. Retry decides after each attempt and the stack waits
//! out the returned delay through its `Sleeper`. A fallback that applies replaces the final
//! failure; otherwise a failure that ended the loop on a retry limit is reported as
//! `ResilienceError::RetryExhausted`.

use crate::bulkhead::{BulkheadPolicy, SyncBulkheadState};
use crate::circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerState};
use crate::error::{BoxError, ResilienceError};
use crate::factory::FaultToleranceStateFactory;
use crate::fallback::{ExecutionContext, FallbackPolicy};
use crate::result::MethodResult;
use crate::retry::RetryPolicy;
use crate::sleeper::{RetryPause, Sleeper, TokioSleeper};
use crate::timeout::TimeoutPolicy;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Long-lived guard for one method. Clones share the breaker and bulkhead.
pub struct FaultToleranceStack<R> {
    factory: FaultToleranceStateFactory,
    retry: Option<RetryPolicy>,
    timeout: Option<TimeoutPolicy>,
    fallback: Option<FallbackPolicy<R>>,
    circuit_breaker: CircuitBreakerState,
    bulkhead: SyncBulkheadState,
    sleeper: Arc<dyn Sleeper>,
}

impl<R> FaultToleranceStack<R> {
    pub fn builder(factory: FaultToleranceStateFactory) -> FaultToleranceStackBuilder<R> {
        FaultToleranceStackBuilder {
            factory,
            retry: None,
            timeout: None,
            fallback: None,
            circuit_breaker: Breaker::None,
            bulkhead: Bulkhead::None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn circuit_breaker(&self) -> &CircuitBreakerState {
        &self.circuit_breaker
    }

    pub fn bulkhead(&self) -> &SyncBulkheadState {
        &self.bulkhead
    }

    /// Run `operation` under every configured policy.
    ///
    /// `operation` is called once per attempt. `context` is handed to the fallback handler.
    pub async fn execute<Op, Fut, E>(
        &self,
        context: &ExecutionContext,
        mut operation: Op,
    ) -> MethodResult<R>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        let mut retry = self.factory.create_retry_state(self.retry.as_ref());
        retry.start();

        let (result, category) = loop {
            let result = self.attempt(&mut operation).await;
            let decision = retry.record_result(&result);
            if !decision.should_retry() {
                break (result, decision.category());
            }
            let pause = RetryPause { completed: retry.attempts(), delay: decision.delay() };
            self.sleeper.pause(pause).await;
        };

        let fallback = self.factory.create_fallback_state(self.fallback.as_ref());
        if fallback.should_apply_fallback(&result) {
            return fallback.run_fallback(result, context);
        }
        match result {
            MethodResult::Failure(last) if category.is_limit() => {
                MethodResult::failure(ResilienceError::RetryExhausted {
                    attempts: retry.attempts(),
                    category,
                    last,
                })
            }
            other => other,
        }
    }

    async fn attempt<Op, Fut, E>(&self, operation: &mut Op) -> MethodResult<R>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Into<BoxError>,
    {
        // Dropping this future mid-attempt drops the permit, which frees a half-open trial slot.
        let Some(permit) = self.circuit_breaker.request_permission() else {
            return MethodResult::failure(self.circuit_breaker.rejection());
        };
        let mut timeout = self.factory.create_timeout_state(self.timeout.as_ref());
        let result = timeout
            .run(self.bulkhead.execute(async { MethodResult::from_result(operation().await) }))
            .await;
        self.circuit_breaker.record_result(permit, &result);
        result
    }
}

impl<R> Clone for FaultToleranceStack<R> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            retry: self.retry.clone(),
            timeout: self.timeout,
            fallback: self.fallback.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            bulkhead: self.bulkhead.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<R> fmt::Debug for FaultToleranceStack<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultToleranceStack")
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("fallback", &self.fallback)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("bulkhead", &self.bulkhead)
            .finish()
    }
}

enum Breaker {
    None,
    Policy(CircuitBreakerPolicy),
    Shared(CircuitBreakerState),
}

enum Bulkhead {
    None,
    Policy(BulkheadPolicy),
    Shared(SyncBulkheadState),
}

/// Builder for [`FaultToleranceStack`]. Unset policies leave that layer inert.
pub struct FaultToleranceStackBuilder<R> {
    factory: FaultToleranceStateFactory,
    retry: Option<RetryPolicy>,
    timeout: Option<TimeoutPolicy>,
    fallback: Option<FallbackPolicy<R>>,
    circuit_breaker: Breaker,
    bulkhead: Bulkhead,
    sleeper: Arc<dyn Sleeper>,
}

impl<R> FaultToleranceStackBuilder<R> {
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(policy);
        self
    }

    pub fn fallback(mut self, policy: FallbackPolicy<R>) -> Self {
        self.fallback = Some(policy);
        self
    }

    /// A breaker owned by this stack.
    pub fn circuit_breaker(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker = Breaker::Policy(policy);
        self
    }

    /// Share an existing breaker, e.g. one from a `StateRegistry`.
    pub fn shared_circuit_breaker(mut self, state: CircuitBreakerState) -> Self {
        self.circuit_breaker = Breaker::Shared(state);
        self
    }

    /// A bulkhead owned by this stack. Only `max_concurrent` is used; attempts never queue.
    pub fn bulkhead(mut self, policy: BulkheadPolicy) -> Self {
        self.bulkhead = Bulkhead::Policy(policy);
        self
    }

    pub fn shared_bulkhead(mut self, state: SyncBulkheadState) -> Self {
        self.bulkhead = Bulkhead::Shared(state);
        self
    }

    /// Replace the tokio sleeper that waits out retry pauses.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> FaultToleranceStack<R> {
        let circuit_breaker = match self.circuit_breaker {
            Breaker::None => self.factory.create_circuit_breaker_state(None),
            Breaker::Policy(policy) => self.factory.create_circuit_breaker_state(Some(&policy)),
            Breaker::Shared(state) => state,
        };
        let bulkhead = match self.bulkhead {
            Bulkhead::None => self.factory.create_sync_bulkhead_state(None),
            Bulkhead::Policy(policy) => self.factory.create_sync_bulkhead_state(Some(&policy)),
            Bulkhead::Shared(state) => state,
        };
        FaultToleranceStack {
            factory: self.factory,
            retry: self.retry,
            timeout: self.timeout,
            fallback: self.fallback,
            circuit_breaker,
            bulkhead,
            sleeper: self.sleeper,
        }
    }
}
