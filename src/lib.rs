#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # lifeline
//!
//! Fault-tolerance state engine: the decision logic behind retry, timeout, circuit breaker,
//! bulkheads and fallback, as small state machines a host can drive around any guarded call.
//!
//! ## Features
//!
//! - **Retry** decisions with `max_retries`, `max_duration`, backoff and jitter, `retry_on` and
//!   `abort_on` classification
//! - **Timeout** timers with an at-most-once callback and an interrupt signal
//! - **Circuit breakers** over a rolling window with half-open trials
//! - **Bulkheads**, synchronous (reject when full) and asynchronous (bounded FIFO queue)
//! - **Fallback** selection with `apply_on`/`skip_on`
//! - One **factory** that builds every state, handing out inert states for missing policies
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::{
//!     CircuitBreakerPolicy, ExecutionContext, FaultToleranceStack, FaultToleranceStateFactory,
//!     RetryPolicy, TimeoutPolicy,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = FaultToleranceStateFactory::try_current().unwrap();
//!     let stack = FaultToleranceStack::<u32>::builder(factory)
//!         .retry(RetryPolicy::builder().max_retries(2).build().unwrap())
//!         .timeout(TimeoutPolicy::new(Duration::from_secs(1)).unwrap())
//!         .circuit_breaker(CircuitBreakerPolicy::default())
//!         .build();
//!
//!     let result = stack
//!         .execute(&ExecutionContext::new("answer"), || async {
//!             Ok::<_, std::io::Error>(42)
//!         })
//!         .await;
//!     assert_eq!(result.value(), Some(&42));
//! }
//! ```

pub mod async_bulkhead;
pub mod backoff;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod jitter;
pub mod prelude;
pub mod registry;
pub mod result;
pub mod retry;
pub mod runtime;
pub mod sleeper;
pub mod stack;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use async_bulkhead::{
    AsyncBulkheadState, BulkheadReservation, ExecutionReference, ExecutionStatus, TaskPanicked,
};
pub use backoff::Backoff;
pub use bulkhead::{BulkheadPolicy, SyncBulkheadState};
pub use circuit_breaker::{
    CircuitBreakerPolicy, CircuitBreakerPolicyBuilder, CircuitBreakerState, CircuitPermit,
    CircuitSnapshot, CircuitState,
};
pub use classify::{ErrorClass, ErrorClassSet};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{BoxError, PolicyError, ResilienceError, SharedError};
pub use factory::FaultToleranceStateFactory;
pub use fallback::{ExecutionContext, FallbackPolicy, FallbackPolicyBuilder, FallbackState};
pub use jitter::Jitter;
pub use registry::{RegistryError, StateRegistry};
pub use result::MethodResult;
pub use retry::{RetryCategory, RetryPolicy, RetryPolicyBuilder, RetryResult, RetryState};
pub use runtime::{CancelHandle, Executor, ManualScheduler, Scheduler, TokioRuntime};
pub use sleeper::{InstantSleeper, RetryPause, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{FaultToleranceStack, FaultToleranceStackBuilder};
pub use timeout::{InterruptSignal, TimeoutPolicy, TimeoutState};
