//! Guarded call: retry + breaker + bulkhead + timeout + fallback around a flaky lookup.
use lifeline::prelude::*;
use lifeline::telemetry::MemoryRecorder;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct UserId(u64);

#[tokio::main]
async fn main() -> Result<(), SharedError> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let recorder = MemoryRecorder::new();
    let factory = FaultToleranceStateFactory::try_current()
        .expect("running inside tokio")
        .with_recorder(recorder.clone());

    let stack = FaultToleranceStack::<String>::builder(factory)
        .retry(
            RetryPolicy::builder()
                .max_retries(3)
                .backoff(
                    Backoff::exponential(Duration::from_millis(50))
                        .with_max(Duration::from_millis(400))
                        .expect("valid backoff cap"),
                )
                .with_jitter(Jitter::equal())
                .build()
                .expect("valid retry policy"),
        )
        .timeout(TimeoutPolicy::new(Duration::from_millis(500)).expect("valid timeout"))
        .circuit_breaker(
            CircuitBreakerPolicy::builder()
                .request_volume_threshold(4)
                .failure_ratio(0.5)
                .build()
                .expect("valid breaker"),
        )
        .bulkhead(BulkheadPolicy::new(8, 0))
        .fallback(
            FallbackPolicy::builder(|ctx: &ExecutionContext, err: &SharedError| {
                let user = ctx.arguments::<UserId>().map(|id| id.0).unwrap_or_default();
                Ok(format!("guest-{user} (fallback after: {err})"))
            })
            .skip_on(ErrorClass::bulkhead())
            .build(),
        )
        .build();

    let attempts = Arc::new(AtomicUsize::new(0));
    let context = ExecutionContext::new("lookup_user").with_arguments(UserId(42));

    for _ in 0..3 {
        let attempts = attempts.clone();
        let result = stack
            .execute(&context, move || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n % 3 == 2 {
                        Ok(format!("user-42 (attempt {})", n + 1))
                    } else {
                        Err(std::io::Error::other("directory unavailable"))
                    }
                }
            })
            .await
            .into_result()?;
        println!("lookup result: {result}");
    }

    println!("breaker state: {}", stack.circuit_breaker().state());
    for event in recorder.events() {
        println!("event: {event}");
    }
    Ok(())
}
