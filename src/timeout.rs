//! Time-bounding a single execution attempt.
//!
//! A `TimeoutState` is created fresh for every attempt. `start` arms a callback on the
//! [`Scheduler`]; `stop` disarms it. The timer and `stop` race on one compare-and-swap over the
//! attempt's phase, so exactly one side wins:
//!
//! - timer wins: the [`InterruptSignal`] is raised, the timeout callback runs, and
//!   `is_timed_out()` reports `true` once `stop` returns;
//! - `stop` wins: the callback never runs and the signal is never raised.
//!
//! `stop` does not return while a winning timer is still running the callback.

use crate::error::{PolicyError, ResilienceError};
use crate::result::MethodResult;
use crate::runtime::{CancelHandle, Scheduler};
use crate::telemetry::{MetricRecorder, PolicyEvent, TimeoutEvent};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const FIRED: u8 = 2;
const STOPPED: u8 = 3;

/// Action run on the timer's thread when the deadline wins.
pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// Immutable timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. Zero durations are rejected.
    pub fn new(duration: Duration) -> Result<Self, PolicyError> {
        if duration.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Cancellation request raised when an attempt's deadline wins.
///
/// Synchronous work polls [`InterruptSignal::is_raised`]; asynchronous work awaits
/// [`InterruptSignal::raised`]. Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug, Default)]
struct SignalInner {
    raised: AtomicBool,
    notify: Notify,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    /// Resolves once the signal is raised; immediately if it already was.
    pub async fn raised(&self) {
        let notified = self.inner.notify.notified();
        futures::pin_mut!(notified);
        notified.as_mut().enable();
        if self.is_raised() {
            return;
        }
        notified.await;
    }

    pub(crate) fn raise(&self) {
        if !self.inner.raised.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }
}

/// Deadline bookkeeping for one attempt.
pub struct TimeoutState {
    kind: TimeoutKind,
}

enum TimeoutKind {
    Active(ActiveTimeout),
    Inert(InterruptSignal),
}

struct ActiveTimeout {
    timer: Arc<Timer>,
    scheduler: Arc<dyn Scheduler>,
    handle: Option<Box<dyn CancelHandle>>,
    started_at: Option<Instant>,
}

/// The part of the state shared with the scheduled callback.
struct Timer {
    duration: Duration,
    phase: AtomicU8,
    callback: Mutex<Option<TimeoutCallback>>,
    signal: InterruptSignal,
    recorder: Arc<dyn MetricRecorder>,
}

impl Timer {
    fn fire(&self) {
        let mut callback = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        if self.phase.compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        tracing::warn!(timeout = ?self.duration, "attempt timed out");
        self.signal.raise();
        self.recorder.record(&PolicyEvent::Timeout(TimeoutEvent::Occurred {
            timeout: self.duration,
        }));
        if let Some(callback) = callback.take() {
            callback();
        }
    }
}

impl TimeoutState {
    pub(crate) fn new(
        policy: TimeoutPolicy,
        scheduler: Arc<dyn Scheduler>,
        recorder: Arc<dyn MetricRecorder>,
    ) -> Self {
        let timer = Arc::new(Timer {
            duration: policy.duration,
            phase: AtomicU8::new(IDLE),
            callback: Mutex::new(None),
            signal: InterruptSignal::new(),
            recorder,
        });
        Self {
            kind: TimeoutKind::Active(ActiveTimeout {
                timer,
                scheduler,
                handle: None,
                started_at: None,
            }),
        }
    }

    pub(crate) fn inert() -> Self {
        Self { kind: TimeoutKind::Inert(InterruptSignal::new()) }
    }

    /// Arm the deadline. Only the first call on an instance has any effect.
    pub fn start(&mut self) {
        let TimeoutKind::Active(active) = &mut self.kind else {
            return;
        };
        let armed = active.timer.phase.compare_exchange(
            IDLE,
            ARMED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if armed.is_err() {
            tracing::warn!("timeout already started; create a fresh state per attempt");
            return;
        }
        active.started_at = Some(Instant::now());
        let timer = active.timer.clone();
        let handle =
            active.scheduler.schedule(active.timer.duration, Box::new(move || timer.fire()));
        active.handle = Some(handle);
    }

    /// Register the action to run if the deadline wins.
    ///
    /// Registered after the deadline already won, the callback runs immediately on the calling
    /// thread. Registered after `stop`, it is dropped.
    pub fn set_timeout_callback<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let TimeoutKind::Active(active) = &self.kind else {
            return;
        };
        let mut slot = active.timer.callback.lock().unwrap_or_else(PoisonError::into_inner);
        match active.timer.phase.load(Ordering::Acquire) {
            IDLE | ARMED => *slot = Some(Box::new(callback)),
            FIRED => {
                drop(slot);
                callback();
            }
            _ => {}
        }
    }

    /// Disarm the deadline. Calling it twice is a no-op.
    pub fn stop(&mut self) {
        let TimeoutKind::Active(active) = &mut self.kind else {
            return;
        };
        if let Some(handle) = active.handle.take() {
            handle.cancel();
        }
        let timer = &active.timer;
        let mut phase = timer.phase.load(Ordering::Acquire);
        loop {
            match phase {
                IDLE | ARMED => {
                    match timer.phase.compare_exchange(
                        phase,
                        STOPPED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            timer.callback.lock().unwrap_or_else(PoisonError::into_inner).take();
                            return;
                        }
                        Err(actual) => phase = actual,
                    }
                }
                FIRED => {
                    // Wait for a callback still running on the timer thread.
                    drop(timer.callback.lock().unwrap_or_else(PoisonError::into_inner));
                    return;
                }
                _ => return,
            }
        }
    }

    /// Whether the deadline won the race. Meaningful once `stop` has returned.
    pub fn is_timed_out(&self) -> bool {
        match &self.kind {
            TimeoutKind::Active(active) => active.timer.phase.load(Ordering::Acquire) == FIRED,
            TimeoutKind::Inert(_) => false,
        }
    }

    /// Signal raised when the deadline wins; never raised for the inert variant.
    pub fn signal(&self) -> InterruptSignal {
        match &self.kind {
            TimeoutKind::Active(active) => active.timer.signal.clone(),
            TimeoutKind::Inert(signal) => signal.clone(),
        }
    }

    /// Configured deadline, `None` for the inert variant.
    pub fn duration(&self) -> Option<Duration> {
        match &self.kind {
            TimeoutKind::Active(active) => Some(active.timer.duration),
            TimeoutKind::Inert(_) => None,
        }
    }

    /// Run one async attempt against the deadline.
    ///
    /// Reports exactly one outcome: the attempt's own result, or `ResilienceError::Timeout` when
    /// the deadline won. A losing attempt future is dropped.
    pub async fn run<F, R>(&mut self, attempt: F) -> MethodResult<R>
    where
        F: Future<Output = MethodResult<R>>,
    {
        let timeout = match self.duration() {
            Some(timeout) => timeout,
            None => return attempt.await,
        };
        self.start();
        let signal = self.signal();
        let outcome = tokio::select! {
            result = attempt => Some(result),
            _ = signal.raised() => None,
        };
        self.stop();

        match (self.is_timed_out(), outcome) {
            (false, Some(result)) => result,
            _ => {
                let elapsed = match &self.kind {
                    TimeoutKind::Active(active) => {
                        active.started_at.map(|at| at.elapsed()).unwrap_or(timeout)
                    }
                    TimeoutKind::Inert(_) => timeout,
                };
                MethodResult::failure(ResilienceError::Timeout { elapsed, timeout })
            }
        }
    }
}

impl Drop for TimeoutState {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimeoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TimeoutKind::Active(active) => f
                .debug_struct("TimeoutState")
                .field("duration", &active.timer.duration)
                .field("phase", &active.timer.phase.load(Ordering::Acquire))
                .finish(),
            TimeoutKind::Inert(_) => f.write_str("TimeoutState(inert)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ManualScheduler, TokioRuntime};
    use crate::telemetry::{MemoryRecorder, NullRecorder};
    use std::sync::atomic::AtomicUsize;

    fn manual_state(ms: u64, scheduler: &ManualScheduler) -> TimeoutState {
        TimeoutState::new(
            TimeoutPolicy::new(Duration::from_millis(ms)).unwrap(),
            Arc::new(scheduler.clone()),
            Arc::new(NullRecorder),
        )
    }

    fn counting_callback(hits: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let hits = hits.clone();
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn zero_duration_is_rejected() {
        assert_eq!(TimeoutPolicy::new(Duration::ZERO), Err(PolicyError::ZeroTimeout));
    }

    #[test]
    fn deadline_fires_callback_and_signal() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut state = manual_state(100, &scheduler);
        state.start();
        state.set_timeout_callback(counting_callback(&hits));
        let signal = state.signal();

        scheduler.advance(Duration::from_millis(100));
        state.stop();

        assert!(state.is_timed_out());
        assert!(signal.is_raised());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_deadline_suppresses_callback() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut state = manual_state(100, &scheduler);
        state.start();
        state.set_timeout_callback(counting_callback(&hits));

        scheduler.advance(Duration::from_millis(50));
        state.stop();
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(Duration::from_millis(100));

        assert!(!state.is_timed_out());
        assert!(!state.signal().is_raised());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn late_registration_after_firing_runs_immediately() {
        let scheduler = ManualScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut state = manual_state(10, &scheduler);
        state.start();
        scheduler.advance(Duration::from_millis(10));

        state.set_timeout_callback(counting_callback(&hits));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        state.stop();
        state.set_timeout_callback(counting_callback(&hits));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn double_stop_and_double_start_are_harmless() {
        let scheduler = ManualScheduler::new();
        let mut state = manual_state(10, &scheduler);
        state.start();
        state.start();
        assert_eq!(scheduler.pending(), 1);
        state.stop();
        state.stop();
        assert!(!state.is_timed_out());
    }

    #[test]
    fn timeouts_are_recorded() {
        let scheduler = ManualScheduler::new();
        let recorder = MemoryRecorder::new();
        let mut state = TimeoutState::new(
            TimeoutPolicy::new(Duration::from_millis(5)).unwrap(),
            Arc::new(scheduler.clone()),
            Arc::new(recorder.clone()),
        );
        state.start();
        scheduler.advance(Duration::from_millis(5));
        state.stop();
        assert_eq!(
            recorder.events(),
            vec![PolicyEvent::Timeout(TimeoutEvent::Occurred { timeout: Duration::from_millis(5) })]
        );
    }

    #[test]
    fn inert_state_never_times_out() {
        let mut state = TimeoutState::inert();
        state.start();
        state.set_timeout_callback(|| panic!("inert timeout must not fire"));
        state.stop();
        assert!(!state.is_timed_out());
        assert_eq!(state.duration(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_timeout_for_slow_attempts() {
        let mut state = TimeoutState::new(
            TimeoutPolicy::new(Duration::from_millis(50)).unwrap(),
            Arc::new(TokioRuntime::current()),
            Arc::new(NullRecorder),
        );
        let result: MethodResult<u32> = state
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                MethodResult::success(1)
            })
            .await;

        let err = result.error_as::<ResilienceError>().expect("timeout error");
        assert_eq!(err.timeout_details().map(|(_, limit)| limit), Some(Duration::from_millis(50)));
        assert!(state.is_timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn run_passes_through_fast_attempts() {
        let mut state = TimeoutState::new(
            TimeoutPolicy::new(Duration::from_secs(1)).unwrap(),
            Arc::new(TokioRuntime::current()),
            Arc::new(NullRecorder),
        );
        let result = state.run(async { MethodResult::success(42) }).await;
        assert_eq!(result.value(), Some(&42));
        assert!(!state.is_timed_out());
    }

    #[tokio::test]
    async fn signal_resolves_waiters() {
        let signal = InterruptSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.raised().await })
        };
        tokio::task::yield_now().await;
        signal.raise();
        waiter.await.unwrap();
        signal.raised().await;
    }
}
