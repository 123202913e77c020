//! Base delay computation for retries.
//!
//! Retry numbering starts at `1` for the first retry; `delay(0)` is the initial attempt and is
//! always zero. A policy's configured `delay` becomes a constant backoff unless a linear or
//! exponential progression is chosen explicitly.
//!
//! ```rust
//! use std::time::Duration;
//! use lifeline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2)); // capped
//! ```
//!
//! Computations that would overflow saturate to [`MAX_BACKOFF`].

use std::time::Duration;
use thiserror::Error;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    ConstantDoesNotSupportMax,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Delay progression between retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Constant(Duration),
    /// `base * retry`, optionally capped.
    Linear { base: Duration, max: Option<Duration> },
    /// `base * 2^(retry - 1)`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant(delay)
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: None }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, max: None }
    }

    /// Cap a linear or exponential progression.
    pub fn with_max(self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match self {
            Backoff::Constant(_) => Err(BackoffError::ConstantDoesNotSupportMax),
            Backoff::Linear { base, .. } if max < base => {
                Err(BackoffError::MaxLessThanBase { base, max })
            }
            Backoff::Exponential { base, .. } if max < base => {
                Err(BackoffError::MaxLessThanBase { base, max })
            }
            Backoff::Linear { base, .. } => Ok(Backoff::Linear { base, max: Some(max) }),
            Backoff::Exponential { base, .. } => Ok(Backoff::Exponential { base, max: Some(max) }),
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let (raw, max) = match self {
            Backoff::Constant(delay) => (*delay, None),
            Backoff::Linear { base, max } => {
                (base.checked_mul(retry).unwrap_or(MAX_BACKOFF), *max)
            }
            Backoff::Exponential { base, max } => {
                let multiplier = 2u128.saturating_pow(retry - 1);
                let nanos = base.as_nanos().saturating_mul(multiplier).min(MAX_BACKOFF.as_nanos());
                (Duration::from_nanos(nanos as u64), *max)
            }
        };
        let capped = max.map_or(raw, |m| raw.min(m));
        capped.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Constant(Duration::ZERO)
    }
}
