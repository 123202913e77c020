//! External execution services consumed by the engine.
//!
//! The engine never owns threads. Timeouts arm callbacks on a [`Scheduler`] and the async
//! bulkhead runs accepted work on an [`Executor`]; both hand back a [`CancelHandle`] so pending
//! timers and running tasks can be stopped. [`TokioRuntime`] implements both on a tokio
//! runtime handle. [`ManualScheduler`] fires timers only when told to, which makes timeout races
//! reproducible in tests.

use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;

/// A deferred callback run by a [`Scheduler`].
pub type ScheduledCallback = Box<dyn FnOnce() + Send + 'static>;

/// Stops a scheduled callback or a spawned task. Cancelling twice, or after completion, is a no-op.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// Runs a callback once after a delay.
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule(&self, delay: Duration, callback: ScheduledCallback) -> Box<dyn CancelHandle>;
}

/// Runs a unit of asynchronous work.
pub trait Executor: Send + Sync + fmt::Debug {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Box<dyn CancelHandle>;
}

impl CancelHandle for tokio::task::AbortHandle {
    fn cancel(&self) {
        self.abort();
    }
}

/// Scheduler and executor backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioRuntime {
    handle: Handle,
}

impl TokioRuntime {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime; use [`TokioRuntime::try_current`] to check.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioRuntime {
    fn schedule(&self, delay: Duration, callback: ScheduledCallback) -> Box<dyn CancelHandle> {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        Box::new(task.abort_handle())
    }
}

impl Executor for TokioRuntime {
    fn spawn(&self, task: BoxFuture<'static, ()>) -> Box<dyn CancelHandle> {
        Box::new(self.handle.spawn(task).abort_handle())
    }
}

struct PendingCallback {
    due: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: ScheduledCallback,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    next_seq: u64,
    pending: Vec<PendingCallback>,
}

/// Scheduler whose time only moves through [`ManualScheduler::advance`].
///
/// Due callbacks run on the thread calling `advance`, in deadline order.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward and run every callback that became due.
    pub fn advance(&self, by: Duration) {
        let mut due = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.now = state.now.saturating_add(by);
            let now = state.now;
            let (ready, waiting): (Vec<_>, Vec<_>) =
                state.pending.drain(..).partition(|p| p.due <= now);
            state.pending = waiting;
            ready
        };
        due.sort_by_key(|p| (p.due, p.seq));
        for pending in due {
            if !pending.cancelled.load(Ordering::Acquire) {
                (pending.callback)();
            }
        }
    }

    /// Callbacks that are neither due nor cancelled.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.pending.iter().filter(|p| !p.cancelled.load(Ordering::Acquire)).count()
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler").field("pending", &self.pending()).finish()
    }
}

struct ManualCancel(Arc<AtomicBool>);

impl CancelHandle for ManualCancel {
    fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, callback: ScheduledCallback) -> Box<dyn CancelHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let due = state.now.saturating_add(delay);
        let seq = state.next_seq;
        state.next_seq += 1;
        state.pending.push(PendingCallback { due, seq, cancelled: cancelled.clone(), callback });
        Box::new(ManualCancel(cancelled))
    }
}
