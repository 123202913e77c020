//! The success/failure value exchanged between every primitive.
//!
//! A `MethodResult` is produced once per execution attempt and never mutated. Failures are
//! stored behind an `Arc` so the same outcome can be inspected by the circuit breaker, the
//! retry state, and the fallback state without cloning the underlying error.

use crate::error::{BoxError, SharedError};
use std::fmt;
use std::sync::Arc;

/// Outcome of one attempt at a guarded call.
#[derive(Clone)]
pub enum MethodResult<R> {
    /// The call returned a value.
    Success(R),
    /// The call (or the engine on its behalf) failed.
    Failure(SharedError),
}

impl<R> MethodResult<R> {
    /// Wrap a successful value.
    pub fn success(value: R) -> Self {
        MethodResult::Success(value)
    }

    /// Wrap any error convertible into a boxed error.
    pub fn failure<E>(error: E) -> Self
    where
        E: Into<BoxError>,
    {
        MethodResult::Failure(Arc::from(error.into()))
    }

    /// Wrap an error that is already shared.
    pub fn from_shared(error: SharedError) -> Self {
        MethodResult::Failure(error)
    }

    /// Convert a plain `Result` into a `MethodResult`.
    pub fn from_result<E>(result: Result<R, E>) -> Self
    where
        E: Into<BoxError>,
    {
        match result {
            Ok(value) => MethodResult::success(value),
            Err(err) => MethodResult::failure(err),
        }
    }

    /// True when the attempt produced a value.
    pub fn is_success(&self) -> bool {
        matches!(self, MethodResult::Success(_))
    }

    /// True when the attempt failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, MethodResult::Failure(_))
    }

    /// The value, or `None` when queried on a failure.
    pub fn value(&self) -> Option<&R> {
        match self {
            MethodResult::Success(value) => Some(value),
            MethodResult::Failure(_) => None,
        }
    }

    /// The error, or `None` when queried on a success.
    pub fn error(&self) -> Option<&SharedError> {
        match self {
            MethodResult::Success(_) => None,
            MethodResult::Failure(err) => Some(err),
        }
    }

    /// Downcast the failure to a concrete error type.
    pub fn error_as<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error().and_then(|err| err.downcast_ref::<E>())
    }

    /// Consume into a standard `Result`.
    pub fn into_result(self) -> Result<R, SharedError> {
        match self {
            MethodResult::Success(value) => Ok(value),
            MethodResult::Failure(err) => Err(err),
        }
    }

    /// Transform the success value, leaving failures untouched.
    pub fn map<U, F>(self, f: F) -> MethodResult<U>
    where
        F: FnOnce(R) -> U,
    {
        match self {
            MethodResult::Success(value) => MethodResult::Success(f(value)),
            MethodResult::Failure(err) => MethodResult::Failure(err),
        }
    }
}

impl<R, E> From<Result<R, E>> for MethodResult<R>
where
    E: Into<BoxError>,
{
    fn from(result: Result<R, E>) -> Self {
        MethodResult::from_result(result)
    }
}

/// Successes compare by value; failures are equal only when they share the same error instance.
impl<R: PartialEq> PartialEq for MethodResult<R> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MethodResult::Success(a), MethodResult::Success(b)) => a == b,
            (MethodResult::Failure(a), MethodResult::Failure(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<R: fmt::Debug> fmt::Debug for MethodResult<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodResult::Success(value) => f.debug_tuple("Success").field(value).finish(),
            MethodResult::Failure(err) => f.debug_tuple("Failure").field(&err.to_string()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResilienceError;
    use std::io;

    #[test]
    fn accessors_match_variant() {
        let ok: MethodResult<u32> = MethodResult::success(7);
        assert!(ok.is_success());
        assert_eq!(ok.value(), Some(&7));
        assert!(ok.error().is_none());

        let failed: MethodResult<u32> = MethodResult::failure("boom");
        assert!(failed.is_failure());
        assert!(failed.value().is_none());
        assert_eq!(failed.error().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn failure_keeps_concrete_type_for_downcast() {
        let result: MethodResult<()> =
            MethodResult::failure(io::Error::new(io::ErrorKind::NotFound, "missing"));
        let io_err = result.error_as::<io::Error>().expect("io error");
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
        assert!(result.error_as::<ResilienceError>().is_none());
    }

    #[test]
    fn failures_compare_by_identity() {
        let a: MethodResult<u8> = MethodResult::failure("x");
        let b: MethodResult<u8> = MethodResult::failure("x");
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_eq!(MethodResult::success(1u8), MethodResult::success(1u8));
    }

    #[test]
    fn converts_from_result() {
        let from_ok: MethodResult<i32> = Ok::<_, io::Error>(3).into();
        assert_eq!(from_ok.into_result().ok(), Some(3));

        let from_err: MethodResult<i32> =
            MethodResult::from_result(Err::<i32, _>(io::Error::new(io::ErrorKind::Other, "no")));
        assert!(from_err.map(|v| v * 2).is_failure());
    }
}
