//! Convenient re-exports for common lifeline types.
pub use crate::{
    async_bulkhead::{AsyncBulkheadState, BulkheadReservation, ExecutionReference, ExecutionStatus},
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    bulkhead::{BulkheadPolicy, SyncBulkheadState},
    circuit_breaker::{CircuitBreakerPolicy, CircuitBreakerState, CircuitPermit, CircuitState},
    classify::{ErrorClass, ErrorClassSet},
    error::{PolicyError, ResilienceError, SharedError},
    factory::FaultToleranceStateFactory,
    fallback::{ExecutionContext, FallbackPolicy, FallbackState},
    jitter::Jitter,
    result::MethodResult,
    retry::{RetryCategory, RetryPolicy, RetryState},
    stack::FaultToleranceStack,
    telemetry::{MetricRecorder, PolicyEvent},
    timeout::{TimeoutPolicy, TimeoutState},
};
