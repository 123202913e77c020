mod common;

use common::{failed, manual_factory};
use futures::FutureExt;
use lifeline::{
    CircuitBreakerPolicy, CircuitBreakerState, CircuitPermit, CircuitState, ExecutionContext,
    FaultToleranceStack, MethodResult,
};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn volume_four() -> CircuitBreakerPolicy {
    CircuitBreakerPolicy::builder()
        .request_volume_threshold(4)
        .failure_ratio(0.5)
        .delay(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn admit(breaker: &CircuitBreakerState) -> CircuitPermit {
    breaker.request_permission().expect("breaker should admit")
}

/// Feed outcomes (true = failure) and return the index at which the breaker opened.
fn feed(breaker: &CircuitBreakerState, outcomes: &[bool]) -> Option<usize> {
    let mut latest = VecDeque::new();
    for (index, &failure) in outcomes.iter().enumerate() {
        let permit = breaker.request_permission().expect("closed breaker must admit");
        let result: MethodResult<()> =
            if failure { failed("boom") } else { MethodResult::success(()) };
        breaker.record_result(permit, &result);

        latest.push_back(failure);
        if latest.len() > 4 {
            latest.pop_front();
        }
        let should_trip = latest.len() == 4 && latest.iter().filter(|f| **f).count() >= 2;
        assert_eq!(breaker.state() == CircuitState::Open, should_trip, "after outcome {index}");
        if should_trip {
            return Some(index);
        }
    }
    None
}

#[tokio::test]
async fn two_failures_in_full_window_trip() {
    let (factory, _clock, _) = manual_factory();
    let breaker = factory.create_circuit_breaker_state(Some(&volume_four()));
    assert_eq!(feed(&breaker, &[true, true, false, false]), Some(3));
}

#[tokio::test]
async fn three_failures_trip_once_window_fills() {
    let (factory, _clock, _) = manual_factory();
    let breaker = factory.create_circuit_breaker_state(Some(&volume_four()));
    assert_eq!(feed(&breaker, &[true, true, true, false]), Some(3));
}

#[tokio::test]
async fn single_failure_never_trips_sliding_window() {
    let (factory, _clock, _) = manual_factory();
    let breaker = factory.create_circuit_breaker_state(Some(&volume_four()));
    let outcomes = [false, true, false, false, false, true, false, false];
    assert_eq!(feed(&breaker, &outcomes), None);

    let breaker = factory.create_circuit_breaker_state(Some(&volume_four()));
    let outcomes = [false, true, false, false, false, true, false, false, true];
    assert_eq!(feed(&breaker, &outcomes), Some(8));
}

#[tokio::test]
async fn open_breaker_rejects_until_delay_elapses() {
    let (factory, clock, _) = manual_factory();
    let breaker = factory.create_circuit_breaker_state(Some(&volume_four()));
    feed(&breaker, &[true, true, false, false]);

    assert!(breaker.request_permission().is_none());
    let rejection = breaker.rejection();
    assert!(rejection.is_circuit_open());

    clock.advance(Duration::from_secs(5));
    let trial = admit(&breaker);
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_result(trial, &MethodResult::success(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn half_open_admits_at_most_success_threshold() {
    let (factory, clock, _) = manual_factory();
    let policy = CircuitBreakerPolicy::builder()
        .request_volume_threshold(1)
        .delay(Duration::from_millis(100))
        .success_threshold(2)
        .build()
        .unwrap();
    let breaker = factory.create_circuit_breaker_state(Some(&policy));
    breaker.record_result(admit(&breaker), &failed::<()>("down"));
    clock.advance(Duration::from_millis(100));

    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let breaker = breaker.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                breaker.request_permission()
            })
        })
        .collect();
    let trials: Vec<CircuitPermit> =
        handles.into_iter().filter_map(|handle| handle.join().unwrap()).collect();

    assert_eq!(trials.len(), 2);
    assert!(trials.iter().all(CircuitPermit::is_trial));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    for trial in trials {
        breaker.record_result(trial, &MethodResult::success(()));
    }
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn trial_failure_reopens() {
    let (factory, clock, _) = manual_factory();
    let policy = CircuitBreakerPolicy::builder()
        .request_volume_threshold(1)
        .delay(Duration::from_secs(1))
        .success_threshold(3)
        .build()
        .unwrap();
    let breaker = factory.create_circuit_breaker_state(Some(&policy));
    breaker.record_result(admit(&breaker), &failed::<()>("down"));

    clock.advance(Duration::from_secs(1));
    breaker.record_result(admit(&breaker), &MethodResult::success(()));
    breaker.record_result(admit(&breaker), &failed::<()>("still down"));

    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.request_permission().is_none());
}

#[tokio::test]
async fn slow_closed_call_cannot_take_a_trial_slot() {
    let (factory, clock, _) = manual_factory();
    let policy = CircuitBreakerPolicy::builder()
        .request_volume_threshold(1)
        .delay(Duration::from_millis(100))
        .success_threshold(2)
        .build()
        .unwrap();
    let breaker = factory.create_circuit_breaker_state(Some(&policy));

    let slow = admit(&breaker);
    breaker.record_result(admit(&breaker), &failed::<()>("down"));
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(100));
    let first_trial = admit(&breaker);
    let second_trial = admit(&breaker);

    breaker.record_result(slow, &MethodResult::success(()));
    assert!(breaker.request_permission().is_none(), "both trials are still running");
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_result(first_trial, &MethodResult::success(()));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.record_result(second_trial, &MethodResult::success(()));
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn slow_closed_success_does_not_close_half_open_breaker() {
    let (factory, clock, _) = manual_factory();
    let policy = CircuitBreakerPolicy::builder()
        .request_volume_threshold(1)
        .delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let breaker = factory.create_circuit_breaker_state(Some(&policy));

    let slow = admit(&breaker);
    breaker.record_result(admit(&breaker), &failed::<()>("down"));
    clock.advance(Duration::from_millis(100));
    let trial = admit(&breaker);

    breaker.record_result(slow, &MethodResult::success(()));
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    breaker.record_result(trial, &failed::<()>("still down"));
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn cancelled_stack_trial_releases_its_slot() {
    let (factory, clock, _) = manual_factory();
    let policy = CircuitBreakerPolicy::builder()
        .request_volume_threshold(1)
        .delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let stack = FaultToleranceStack::<()>::builder(factory).circuit_breaker(policy).build();
    let context = ExecutionContext::new("inventory");

    let tripped = stack.execute(&context, || async { Err::<(), _>(io::Error::other("down")) }).await;
    assert!(tripped.error_as::<io::Error>().is_some());
    clock.advance(Duration::from_millis(100));

    let abandoned = stack
        .execute(&context, || futures::future::pending::<Result<(), io::Error>>())
        .now_or_never();
    assert!(abandoned.is_none());
    assert_eq!(stack.circuit_breaker().state(), CircuitState::HalfOpen);

    let recovered = stack.execute(&context, || async { Ok::<_, io::Error>(()) }).await;
    assert!(recovered.is_success());
    assert_eq!(stack.circuit_breaker().state(), CircuitState::Closed);
}
