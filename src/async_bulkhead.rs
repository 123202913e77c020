//! Queuing bulkhead for work run on an [`Executor`].
//!
//! `submit` never blocks. A task starts immediately when fewer than `max_concurrent` tasks are
//! running, waits in a FIFO queue of at most `max_queue_size` entries otherwise, and is rejected
//! when both are full.
//!
//! A started task receives a [`BulkheadReservation`] holding its permit. Calling
//! [`release`](BulkheadReservation::release) (or dropping the reservation, which also happens when
//! the task finishes, panics, or is aborted) frees the permit exactly once and starts the oldest
//! queued task with it.
//!
//! Failures raised by a task after `submit` returned, `Err` values and panics alike, are handed
//! to the submission's exception handler.

use crate::bulkhead::BulkheadPolicy;
use crate::error::{BoxError, SharedError};
use crate::runtime::{CancelHandle, Executor};
use crate::telemetry::{BulkheadEvent, MetricRecorder, PolicyEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Waiting for a permit.
    Queued,
    /// Handed to the executor.
    Running,
    /// Finished, successfully or not.
    Done,
    /// Aborted through its [`ExecutionReference`].
    Cancelled,
    /// Refused at submission.
    Rejected,
}

/// A bulkhead task panicked; delivered to the exception handler.
#[derive(Debug, Error)]
#[error("bulkhead task panicked: {message}")]
pub struct TaskPanicked {
    message: String,
}

impl TaskPanicked {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

type Job = Box<dyn FnOnce(BulkheadReservation) -> BoxFuture<'static, ()> + Send>;

struct Submission {
    status: AtomicU8,
    job: Mutex<Option<Job>>,
    handle: Mutex<Option<Box<dyn CancelHandle>>>,
}

impl Submission {
    fn transition(&self, from: u8, to: u8) -> bool {
        self.status.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }
}

struct Slots {
    running: usize,
    queue: VecDeque<Arc<Submission>>,
}

struct AsyncBulkhead {
    /// `None` for the inert, unlimited variant.
    max_concurrent: Option<usize>,
    max_queue_size: usize,
    executor: Arc<dyn Executor>,
    recorder: Arc<dyn MetricRecorder>,
    slots: Mutex<Slots>,
}

impl AsyncBulkhead {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrent.unwrap_or(usize::MAX)
    }

    fn record(&self, event: BulkheadEvent) {
        self.recorder.record(&PolicyEvent::Bulkhead(event));
    }

    fn dispatch(self: &Arc<Self>, submission: Arc<Submission>) {
        let job = submission.job.lock().unwrap_or_else(PoisonError::into_inner).take();
        let reservation =
            BulkheadReservation { bulkhead: Some(self.clone()), submission: submission.clone() };
        let Some(job) = job else {
            // Nothing to run; dropping the reservation hands the permit on.
            return;
        };
        let handle = self.executor.spawn(job(reservation));
        let mut slot = submission.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if submission.status.load(Ordering::Acquire) == CANCELLED {
            handle.cancel();
        } else {
            *slot = Some(handle);
        }
    }

    /// Return one permit, or pass it straight to the oldest queued task.
    fn release_permit(self: &Arc<Self>) {
        let next = {
            let mut slots = self.lock();
            loop {
                match slots.queue.pop_front() {
                    Some(submission) if submission.transition(QUEUED, RUNNING) => {
                        break Some((submission, slots.running, slots.queue.len()));
                    }
                    Some(_) => continue,
                    None => {
                        slots.running = slots.running.saturating_sub(1);
                        break None;
                    }
                }
            }
        };
        match next {
            Some((submission, active_count, queued)) => {
                tracing::debug!(active_count, queued, "bulkhead permit passed to queued task");
                self.record(BulkheadEvent::Acquired {
                    active_count,
                    max_concurrency: self.max_concurrency(),
                });
                self.dispatch(submission);
            }
            None => tracing::trace!("bulkhead permit released"),
        }
    }
}

/// Long-lived queuing bulkhead for one guarded method. Clones share permits and queue.
#[derive(Clone)]
pub struct AsyncBulkheadState {
    inner: Arc<AsyncBulkhead>,
}

impl AsyncBulkheadState {
    pub(crate) fn new(
        policy: &BulkheadPolicy,
        executor: Arc<dyn Executor>,
        recorder: Arc<dyn MetricRecorder>,
    ) -> Self {
        Self::build(Some(policy.max_concurrent()), policy.max_queue_size(), executor, recorder)
    }

    pub(crate) fn inert(executor: Arc<dyn Executor>, recorder: Arc<dyn MetricRecorder>) -> Self {
        Self::build(None, 0, executor, recorder)
    }

    fn build(
        max_concurrent: Option<usize>,
        max_queue_size: usize,
        executor: Arc<dyn Executor>,
        recorder: Arc<dyn MetricRecorder>,
    ) -> Self {
        let slots = Slots { running: 0, queue: VecDeque::new() };
        let inner = AsyncBulkhead {
            max_concurrent,
            max_queue_size,
            executor,
            recorder,
            slots: Mutex::new(slots),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit a task without blocking.
    ///
    /// `task` receives the reservation for its permit once it is admitted to run. If the task
    /// returns `Err` or panics, `on_error` receives the failure.
    pub fn submit<F, Fut, E, H>(&self, task: F, on_error: H) -> ExecutionReference
    where
        F: FnOnce(BulkheadReservation) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        H: FnOnce(SharedError) + Send + 'static,
    {
        let submission = Arc::new(Submission {
            status: AtomicU8::new(QUEUED),
            job: Mutex::new(None),
            handle: Mutex::new(None),
        });
        let tracker = Arc::downgrade(&submission);
        let job: Job = Box::new(move |reservation| {
            Box::pin(async move {
                let outcome = AssertUnwindSafe(async move { task(reservation).await })
                    .catch_unwind()
                    .await;
                let failure: Option<SharedError> = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(Arc::from(err.into())),
                    Err(payload) => Some(Arc::new(TaskPanicked::from_payload(payload))),
                };
                if let Some(submission) = tracker.upgrade() {
                    submission.transition(RUNNING, DONE);
                }
                if let Some(err) = failure {
                    tracing::debug!(error = %err, "bulkhead task failed");
                    on_error(err);
                }
            })
        });
        *submission.job.lock().unwrap_or_else(PoisonError::into_inner) = Some(job);

        let bulkhead = &self.inner;
        let max_concurrency = bulkhead.max_concurrency();
        // Nothing could ever drain a queue in front of zero permits.
        let max_queue = if max_concurrency == 0 { 0 } else { bulkhead.max_queue_size };
        let mut slots = bulkhead.lock();
        if slots.running < max_concurrency {
            slots.running += 1;
            submission.status.store(RUNNING, Ordering::Release);
            let active_count = slots.running;
            drop(slots);
            tracing::debug!(active_count, max = max_concurrency, "bulkhead task started");
            bulkhead.record(BulkheadEvent::Acquired { active_count, max_concurrency });
            bulkhead.dispatch(submission.clone());
        } else if slots.queue.len() < max_queue {
            slots.queue.push_back(submission.clone());
            let queued = slots.queue.len();
            drop(slots);
            tracing::debug!(queued, max_queue = bulkhead.max_queue_size, "bulkhead task queued");
            bulkhead.record(BulkheadEvent::Queued { queued, max_queue: bulkhead.max_queue_size });
        } else {
            let active_count = slots.running;
            drop(slots);
            tracing::debug!(active_count, max = max_concurrency, "bulkhead rejected task");
            bulkhead.record(BulkheadEvent::Rejected { active_count, max_concurrency });
            return ExecutionReference { accepted: None };
        }

        ExecutionReference { accepted: Some((bulkhead.clone(), submission)) }
    }

    /// Tasks currently holding a permit.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Tasks waiting for a permit.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Configured concurrency; `None` for the inert variant.
    pub fn max_concurrent(&self) -> Option<usize> {
        self.inner.max_concurrent
    }

    pub fn max_queue_size(&self) -> usize {
        self.inner.max_queue_size
    }
}

impl fmt::Debug for AsyncBulkheadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.inner.lock();
        f.debug_struct("AsyncBulkheadState")
            .field("running", &slots.running)
            .field("queued", &slots.queue.len())
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("max_queue_size", &self.inner.max_queue_size)
            .finish()
    }
}

/// Permit held by a running task.
///
/// Released exactly once: by [`release`](Self::release) or on drop.
pub struct BulkheadReservation {
    bulkhead: Option<Arc<AsyncBulkhead>>,
    submission: Arc<Submission>,
}

impl BulkheadReservation {
    /// Give the permit back. The task may keep running afterwards.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if let Some(bulkhead) = self.bulkhead.take() {
            bulkhead.release_permit();
        }
    }
}

impl Drop for BulkheadReservation {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for BulkheadReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadReservation")
            .field("released", &self.bulkhead.is_none())
            .field("status", &status_of(&self.submission))
            .finish()
    }
}

/// Handle returned by [`AsyncBulkheadState::submit`].
pub struct ExecutionReference {
    accepted: Option<(Arc<AsyncBulkhead>, Arc<Submission>)>,
}

impl ExecutionReference {
    /// False when the bulkhead and its queue were both full.
    pub fn was_accepted(&self) -> bool {
        self.accepted.is_some()
    }

    pub fn status(&self) -> ExecutionStatus {
        match &self.accepted {
            Some((_, submission)) => status_of(submission),
            None => ExecutionStatus::Rejected,
        }
    }

    /// Cancel the task.
    ///
    /// A queued task is removed from the queue without consuming a permit. A running task is
    /// interrupted only when `may_interrupt` is set; its permit is freed once the task is torn
    /// down. Returns whether this call cancelled the task.
    pub fn abort(&self, may_interrupt: bool) -> bool {
        let Some((bulkhead, submission)) = &self.accepted else {
            return false;
        };
        match submission.status.load(Ordering::Acquire) {
            QUEUED => {
                let mut slots = bulkhead.lock();
                if !submission.transition(QUEUED, CANCELLED) {
                    drop(slots);
                    return self.abort(may_interrupt);
                }
                slots.queue.retain(|queued| !Arc::ptr_eq(queued, submission));
                drop(slots);
                submission.job.lock().unwrap_or_else(PoisonError::into_inner).take();
                tracing::debug!("queued bulkhead task aborted");
                true
            }
            RUNNING if may_interrupt => {
                if !submission.transition(RUNNING, CANCELLED) {
                    return false;
                }
                let handle = submission.handle.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(handle) = handle.as_ref() {
                    handle.cancel();
                }
                tracing::debug!("running bulkhead task interrupted");
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for ExecutionReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionReference").field("status", &self.status()).finish()
    }
}

fn status_of(submission: &Submission) -> ExecutionStatus {
    match submission.status.load(Ordering::Acquire) {
        QUEUED => ExecutionStatus::Queued,
        RUNNING => ExecutionStatus::Running,
        DONE => ExecutionStatus::Done,
        _ => ExecutionStatus::Cancelled,
    }
}
