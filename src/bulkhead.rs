//! Non-queuing bulkhead for work that runs on the caller.
//!
//! Admission takes one of `max_concurrent` semaphore permits without waiting. When none is
//! free the work is not run and the caller gets a `ResilienceError::Bulkhead` failure. The permit
//! is an RAII guard, so it is returned on every exit path, unwinding included.

use crate::error::{BoxError, ResilienceError};
use crate::result::MethodResult;
use crate::telemetry::{BulkheadEvent, MetricRecorder, PolicyEvent};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Concurrency limits shared by the sync and async bulkheads.
///
/// `max_queue_size` only applies to the async bulkhead. A `max_concurrent` of zero is valid and
/// rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadPolicy {
    max_concurrent: usize,
    max_queue_size: usize,
}

impl BulkheadPolicy {
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self { max_concurrent, max_queue_size }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }
}

impl Default for BulkheadPolicy {
    fn default() -> Self {
        Self::new(10, 10)
    }
}

/// Long-lived admission control for one guarded method. Clones share permits.
#[derive(Clone)]
pub struct SyncBulkheadState {
    kind: SyncKind,
}

#[derive(Clone)]
enum SyncKind {
    Active(Arc<SyncBulkhead>),
    Inert,
}

struct SyncBulkhead {
    semaphore: Semaphore,
    max_concurrent: usize,
    recorder: Arc<dyn MetricRecorder>,
}

impl SyncBulkhead {
    fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    fn try_admit(&self) -> Result<SemaphorePermit<'_>, ResilienceError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                let active_count = self.in_flight();
                tracing::debug!(active_count, max = self.max_concurrent, "bulkhead permit acquired");
                self.recorder.record(&PolicyEvent::Bulkhead(BulkheadEvent::Acquired {
                    active_count,
                    max_concurrency: self.max_concurrent,
                }));
                Ok(permit)
            }
            Err(_) => {
                let in_flight = self.in_flight();
                tracing::debug!(in_flight, max = self.max_concurrent, "bulkhead rejected execution");
                self.recorder.record(&PolicyEvent::Bulkhead(BulkheadEvent::Rejected {
                    active_count: in_flight,
                    max_concurrency: self.max_concurrent,
                }));
                Err(ResilienceError::Bulkhead { in_flight, max: self.max_concurrent })
            }
        }
    }
}

impl SyncBulkheadState {
    pub(crate) fn new(policy: &BulkheadPolicy, recorder: Arc<dyn MetricRecorder>) -> Self {
        let max_concurrent = policy.max_concurrent.min(Semaphore::MAX_PERMITS);
        let bulkhead =
            SyncBulkhead { semaphore: Semaphore::new(max_concurrent), max_concurrent, recorder };
        Self { kind: SyncKind::Active(Arc::new(bulkhead)) }
    }

    pub(crate) fn inert() -> Self {
        Self { kind: SyncKind::Inert }
    }

    /// Run `work` on the calling thread if a permit is free; reject immediately otherwise.
    ///
    /// Panics in `work` propagate after the permit is returned.
    pub fn run<R, E, F>(&self, work: F) -> MethodResult<R>
    where
        F: FnOnce() -> Result<R, E>,
        E: Into<BoxError>,
    {
        let _permit = match &self.kind {
            SyncKind::Active(bulkhead) => match bulkhead.try_admit() {
                Ok(permit) => Some(permit),
                Err(rejected) => return MethodResult::failure(rejected),
            },
            SyncKind::Inert => None,
        };
        MethodResult::from_result(work())
    }

    /// Admit an async attempt under the same rules as [`run`](Self::run).
    pub async fn execute<R, F>(&self, attempt: F) -> MethodResult<R>
    where
        F: Future<Output = MethodResult<R>>,
    {
        let _permit = match &self.kind {
            SyncKind::Active(bulkhead) => match bulkhead.try_admit() {
                Ok(permit) => Some(permit),
                Err(rejected) => return MethodResult::failure(rejected),
            },
            SyncKind::Inert => None,
        };
        attempt.await
    }

    /// Permits currently free; `usize::MAX` for the inert variant.
    pub fn available_permits(&self) -> usize {
        match &self.kind {
            SyncKind::Active(bulkhead) => bulkhead.semaphore.available_permits(),
            SyncKind::Inert => usize::MAX,
        }
    }

    pub fn in_flight(&self) -> usize {
        match &self.kind {
            SyncKind::Active(bulkhead) => bulkhead.in_flight(),
            SyncKind::Inert => 0,
        }
    }

    /// Configured limit; `None` for the inert variant.
    pub fn max_concurrent(&self) -> Option<usize> {
        match &self.kind {
            SyncKind::Active(bulkhead) => Some(bulkhead.max_concurrent),
            SyncKind::Inert => None,
        }
    }
}

impl fmt::Debug for SyncBulkheadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SyncKind::Active(bulkhead) => f
                .debug_struct("SyncBulkheadState")
                .field("in_flight", &bulkhead.in_flight())
                .field("max_concurrent", &bulkhead.max_concurrent)
                .finish(),
            SyncKind::Inert => f.write_str("SyncBulkheadState(inert)"),
        }
    }
}
