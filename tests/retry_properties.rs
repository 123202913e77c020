mod common;

use common::{failed, manual_factory};
use lifeline::{ErrorClass, ErrorClassSet, Jitter, MethodResult, RetryCategory, RetryPolicy};
use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("validation failed")]
struct Invalid;

#[tokio::test]
async fn permanent_failure_makes_n_plus_one_attempts() {
    let (factory, _clock, _) = manual_factory();
    for max_retries in [0u32, 1, 3, 7] {
        let policy = RetryPolicy::builder()
            .max_retries(max_retries)
            .with_jitter(Jitter::None)
            .build()
            .unwrap();
        let mut retry = factory.create_retry_state(Some(&policy));
        retry.start();

        let mut attempts = 0;
        let category = loop {
            attempts += 1;
            let decision = retry.record_result(&failed::<()>("always"));
            if !decision.should_retry() {
                break decision.category();
            }
        };
        assert_eq!(attempts, max_retries + 1);
        assert_eq!(retry.attempts(), max_retries + 1);
        assert_eq!(category, RetryCategory::MaxRetriesReached);
    }
}

#[tokio::test]
async fn abort_on_wins_over_retry_on() {
    let (factory, _clock, _) = manual_factory();
    let policy = RetryPolicy::builder()
        .retry_on(ErrorClassSet::any().with(ErrorClass::of::<Invalid>()))
        .abort_on(ErrorClass::of::<Invalid>())
        .build()
        .unwrap();
    let mut retry = factory.create_retry_state(Some(&policy));
    retry.start();

    let decision = retry.record_result(&MethodResult::<()>::failure(Invalid));
    assert!(!decision.should_retry());
    assert_eq!(decision.category(), RetryCategory::ResultInAbortOn);
}

#[tokio::test]
async fn failures_outside_retry_on_stop_immediately() {
    let (factory, _clock, _) = manual_factory();
    let policy = RetryPolicy::builder().retry_on(ErrorClass::of::<Invalid>()).build().unwrap();
    let mut retry = factory.create_retry_state(Some(&policy));
    retry.start();

    let decision = retry.record_result(&MethodResult::<()>::failure(io::Error::other("io")));
    assert_eq!(decision.category(), RetryCategory::ResultNotRetryable);
}

#[tokio::test]
async fn delay_is_clamped_then_duration_limit_stops() {
    let (factory, clock, _) = manual_factory();
    let policy = RetryPolicy::builder()
        .unlimited_retries()
        .max_duration(Duration::from_millis(1_000))
        .delay(Duration::from_millis(400))
        .with_jitter(Jitter::None)
        .build()
        .unwrap();
    let mut retry = factory.create_retry_state(Some(&policy));
    retry.start();

    let first = retry.record_result(&failed::<()>("slow"));
    assert_eq!(first.delay(), Duration::from_millis(400));

    clock.advance(Duration::from_millis(800));
    let second = retry.record_result(&failed::<()>("slow"));
    assert_eq!(second.category(), RetryCategory::Retry);
    assert_eq!(second.delay(), Duration::from_millis(200));

    clock.advance(Duration::from_millis(200));
    let third = retry.record_result(&failed::<()>("slow"));
    assert_eq!(third.category(), RetryCategory::MaxDurationReached);
}

#[tokio::test]
async fn success_ends_the_loop() {
    let (factory, _clock, _) = manual_factory();
    let mut retry = factory.create_retry_state(Some(&RetryPolicy::default()));
    retry.start();
    assert!(retry.record_result(&failed::<u8>("once")).should_retry());
    let decision = retry.record_result(&MethodResult::success(1u8));
    assert_eq!(decision.category(), RetryCategory::NoRetry);
}
