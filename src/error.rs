//! Error types for the fault-tolerance primitives
use crate::retry::RetryCategory;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Owned, type-erased error accepted from guarded calls and fallback handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shared, immutable error carried by [`MethodResult::Failure`](crate::MethodResult).
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised by the engine itself rather than by the guarded call.
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// The attempt did not finish before its deadline.
    #[error("operation timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The bulkhead had no permit (and, for the async variant, no queue slot) available.
    #[error("bulkhead rejected execution ({in_flight} in-flight, max {max})")]
    Bulkhead { in_flight: usize, max: usize },
    /// The circuit breaker refused the attempt.
    #[error("circuit breaker open (retry in {remaining:?})")]
    CircuitOpen { remaining: Duration },
    /// Retrying stopped on a limit; `last` is the failure of the final attempt.
    #[error("retry stopped after {attempts} attempts ({category}); last error: {last}")]
    RetryExhausted {
        attempts: u32,
        category: RetryCategory,
        #[source]
        last: SharedError,
    },
    /// Queued or running work was cancelled through its execution reference.
    #[error("execution aborted before completion")]
    Aborted,
}

impl ResilienceError {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check if this error is due to bulkhead rejection
    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Self::Bulkhead { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }

    /// Access bulkhead capacity info as (in_flight, max).
    pub fn bulkhead_capacity(&self) -> Option<(usize, usize)> {
        match self {
            Self::Bulkhead { in_flight, max } => Some((*in_flight, *max)),
            _ => None,
        }
    }

    /// The category that ended a retry loop, if this is a `RetryExhausted`.
    pub fn retry_category(&self) -> Option<RetryCategory> {
        match self {
            Self::RetryExhausted { category, .. } => Some(*category),
            _ => None,
        }
    }

    /// The last recorded failure of an exhausted retry loop.
    pub fn last_failure(&self) -> Option<&SharedError> {
        match self {
            Self::RetryExhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}

/// Errors produced when validating policy configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("max_duration ({max_duration:?}) must be greater than delay ({delay:?})")]
    DelayExceedsMaxDuration { delay: Duration, max_duration: Duration },
    #[error("timeout duration must be non-zero")]
    ZeroTimeout,
    #[error("request_volume_threshold must be > 0 (got {0})")]
    InvalidRequestVolume(usize),
    #[error("failure_ratio must be within [0, 1] (got {0})")]
    InvalidFailureRatio(f64),
    #[error("success_threshold must be > 0 (got {0})")]
    InvalidSuccessThreshold(usize),
    #[error(transparent)]
    Backoff(#[from] crate::backoff::BackoffError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;
    use std::io;

    #[test]
    fn timeout_error_display() {
        let err = ResilienceError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
    }

    #[test]
    fn bulkhead_error_display() {
        let err = ResilienceError::Bulkhead { in_flight: 50, max: 50 };
        let msg = err.to_string();
        assert!(msg.contains("bulkhead"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn retry_exhausted_exposes_last_failure_as_source() {
        let last: SharedError = Arc::new(io::Error::new(io::ErrorKind::Other, "disk gone"));
        let err = ResilienceError::RetryExhausted {
            attempts: 4,
            category: RetryCategory::MaxRetriesReached,
            last,
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("disk gone"));
        assert_eq!(err.source().map(|s| s.to_string()), Some("disk gone".to_string()));
        assert_eq!(err.retry_category(), Some(RetryCategory::MaxRetriesReached));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let timeout =
            ResilienceError::Timeout { elapsed: Duration::from_secs(1), timeout: Duration::from_secs(2) };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_circuit_open());
        assert!(timeout.source().is_none());

        let bulkhead = ResilienceError::Bulkhead { in_flight: 1, max: 1 };
        assert!(bulkhead.is_bulkhead());
        assert_eq!(bulkhead.bulkhead_capacity(), Some((1, 1)));
        assert!(bulkhead.timeout_details().is_none());

        let circuit = ResilienceError::CircuitOpen { remaining: Duration::from_secs(1) };
        assert!(circuit.is_circuit_open());
        assert!(circuit.last_failure().is_none());
    }

    #[test]
    fn policy_error_messages_name_the_field() {
        assert!(PolicyError::InvalidFailureRatio(1.5).to_string().contains("failure_ratio"));
        assert!(PolicyError::InvalidRequestVolume(0).to_string().contains("request_volume"));
    }
}
