//! Metrics recording for the fault-tolerance primitives.
//!
//! Every primitive reports what it decided through a [`MetricRecorder`]. Recording is
//! fire-and-forget: a recorder never influences control flow and the engine is correct with
//! [`NullRecorder`].
//!
//! # Event Types
//!
//! - **Retry**: `Scheduled`, `Finished`
//! - **Timeout**: `Occurred`
//! - **Circuit Breaker**: `Opened`, `HalfOpen`, `Closed`, `Rejected`
//! - **Bulkhead**: `Acquired`, `Queued`, `Rejected`
//! - **Fallback**: `Applied`
//!
//! Recorders that forward to external systems can be written as a `tower::Service<PolicyEvent>`
//! and wrapped in [`SinkRecorder`].
//!
//! ```rust
//! use lifeline::telemetry::{MemoryRecorder, MetricRecorder, PolicyEvent, TimeoutEvent};
//! use std::time::Duration;
//!
//! let recorder = MemoryRecorder::new();
//! recorder.record(&PolicyEvent::Timeout(TimeoutEvent::Occurred {
//!     timeout: Duration::from_secs(1),
//! }));
//! assert_eq!(recorder.len(), 1);
//! ```

use crate::retry::RetryCategory;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// Receives policy events. Implementations must not block and must not panic.
pub trait MetricRecorder: Send + Sync + fmt::Debug {
    fn record(&self, event: &PolicyEvent);
}

/// Policy events emitted during execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    Retry(RetryEvent),
    Timeout(TimeoutEvent),
    CircuitBreaker(CircuitBreakerEvent),
    Bulkhead(BulkheadEvent),
    Fallback(FallbackEvent),
}

/// Events emitted by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEvent {
    /// Another attempt will follow after `delay`.
    Scheduled {
        /// Attempts made so far (1-indexed)
        attempt: u32,
        delay: Duration,
    },
    /// The retry loop terminated.
    Finished { attempts: u32, category: RetryCategory },
}

/// Events emitted by timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// The deadline won the race against the attempt.
    Occurred { timeout: Duration },
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    Opened {
        /// Failures in the rolling window (or 1 for a failed trial)
        failures: usize,
        /// Outcomes in the rolling window
        window: usize,
    },
    /// Open period elapsed; trial requests are admitted.
    HalfOpen,
    /// Circuit transitioned to closed state.
    Closed,
    /// A permission request was denied.
    Rejected,
}

/// Events emitted by bulkheads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEvent {
    /// A unit of work obtained a permit.
    Acquired { active_count: usize, max_concurrency: usize },
    /// A unit of work was accepted into the waiting queue.
    Queued { queued: usize, max_queue: usize },
    /// A unit of work was refused admission.
    Rejected { active_count: usize, max_concurrency: usize },
}

/// Events emitted by fallback handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackEvent {
    /// The fallback handler ran; `succeeded` reports whether it returned a value.
    Applied { succeeded: bool },
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Bulkhead(event) => write!(f, "Bulkhead::{}", event),
            PolicyEvent::Fallback(event) => write!(f, "Fallback::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Scheduled { attempt, delay } => {
                write!(f, "Scheduled(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Finished { attempts, category } => {
                write!(f, "Finished(attempts={}, category={})", attempts, category)
            }
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failures, window } => {
                write!(f, "Opened(failures={}/{})", failures, window)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
            CircuitBreakerEvent::Rejected => write!(f, "Rejected"),
        }
    }
}

impl fmt::Display for BulkheadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BulkheadEvent::Acquired { active_count, max_concurrency } => {
                write!(f, "Acquired({}/{})", active_count, max_concurrency)
            }
            BulkheadEvent::Queued { queued, max_queue } => {
                write!(f, "Queued({}/{})", queued, max_queue)
            }
            BulkheadEvent::Rejected { active_count, max_concurrency } => {
                write!(f, "Rejected({}/{})", active_count, max_concurrency)
            }
        }
    }
}

impl fmt::Display for FallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackEvent::Applied { succeeded } => write!(f, "Applied(succeeded={})", succeeded),
        }
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullRecorder;

impl MetricRecorder for NullRecorder {
    fn record(&self, _event: &PolicyEvent) {}
}

/// Logs every event through `tracing` at DEBUG level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRecorder;

impl MetricRecorder for LogRecorder {
    fn record(&self, event: &PolicyEvent) {
        tracing::debug!(event = %event, "policy_event");
    }
}

/// Stores events in memory, evicting the oldest once capacity is reached.
///
/// Clones share the same buffer. Also usable as a `tower::Service<PolicyEvent>` sink.
#[derive(Clone, Debug)]
pub struct MemoryRecorder {
    events: Arc<Mutex<VecDeque<PolicyEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryRecorder {
    /// Creates a bounded recorder (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push(&self, event: PolicyEvent) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<PolicyEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricRecorder for MemoryRecorder {
    fn record(&self, event: &PolicyEvent) {
        self.push(event.clone());
    }
}

impl Service<PolicyEvent> for MemoryRecorder {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        self.push(event);
        Box::pin(async { Ok(()) })
    }
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: PolicyEvent)
where
    S: Service<PolicyEvent, Response = ()> + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Forwards events to a `tower::Service` sink on the current tokio runtime.
///
/// Each event is emitted on its own spawned task so the recording call never waits on the sink.
/// Outside a runtime, or when the sink is not ready or errors, the event is dropped.
#[derive(Clone)]
pub struct SinkRecorder<S> {
    sink: S,
}

impl<S> SinkRecorder<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S> fmt::Debug for SinkRecorder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkRecorder").field("sink", &std::any::type_name::<S>()).finish()
    }
}

impl<S> MetricRecorder for SinkRecorder<S>
where
    S: Service<PolicyEvent, Response = ()> + Clone + Send + Sync + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    fn record(&self, event: &PolicyEvent) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(emit_best_effort(self.sink.clone(), event.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout_event(ms: u64) -> PolicyEvent {
        PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_millis(ms) })
    }

    #[test]
    fn display_formats_are_stable() {
        let opened = PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened {
            failures: 3,
            window: 4,
        });
        assert_eq!(opened.to_string(), "CircuitBreaker::Opened(failures=3/4)");

        let finished = PolicyEvent::Retry(RetryEvent::Finished {
            attempts: 4,
            category: RetryCategory::MaxRetriesReached,
        });
        assert!(finished.to_string().starts_with("Retry::Finished(attempts=4"));

        let queued = PolicyEvent::Bulkhead(BulkheadEvent::Queued { queued: 1, max_queue: 2 });
        assert_eq!(queued.to_string(), "Bulkhead::Queued(1/2)");
    }

    #[test]
    fn memory_recorder_evicts_oldest() {
        let recorder = MemoryRecorder::with_capacity(2);
        recorder.record(&timeout_event(1));
        recorder.record(&timeout_event(2));
        recorder.record(&timeout_event(3));

        assert_eq!(recorder.events(), vec![timeout_event(2), timeout_event(3)]);
        assert_eq!(recorder.evicted(), 1);
        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[test]
    fn sink_recorder_without_runtime_drops_silently() {
        let memory = MemoryRecorder::new();
        let recorder = SinkRecorder::new(memory.clone());
        recorder.record(&timeout_event(5));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn sink_recorder_forwards_on_runtime() {
        let memory = MemoryRecorder::new();
        let recorder = SinkRecorder::new(memory.clone());
        recorder.record(&timeout_event(5));

        for _ in 0..50 {
            if !memory.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(memory.events(), vec![timeout_event(5)]);
    }
}
