#![allow(dead_code)]

use lifeline::{FaultToleranceStateFactory, ManualClock, ManualScheduler, MethodResult};
use std::io;
use std::time::Duration;

/// Factory on the current runtime with deterministic time.
pub fn manual_factory() -> (FaultToleranceStateFactory, ManualClock, ManualScheduler) {
    let clock = ManualClock::new();
    let scheduler = ManualScheduler::new();
    let factory = FaultToleranceStateFactory::try_current()
        .expect("tests run inside a tokio runtime")
        .with_clock(clock.clone())
        .with_scheduler(scheduler.clone());
    (factory, clock, scheduler)
}

pub fn failed<R>(message: &str) -> MethodResult<R> {
    MethodResult::failure(io::Error::other(message.to_string()))
}

/// Poll `condition` until it holds, failing the test after about a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
