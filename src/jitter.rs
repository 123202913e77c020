//! Jitter strategies applied on top of the backoff delay.
//!
//! - `None`: deterministic delays for tests or tightly controlled workflows.
//! - `Bounded(j)`: uniform in `[delay - j, delay + j]`, clamped at zero. This is the retry
//!   policy's `jitter` setting.
//! - `Full`: uniform in `[0, delay]`.
//! - `Equal`: uniform in `[delay/2, delay]`.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! `apply_with_rng`. Millisecond conversions saturate to `u64::MAX`.

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// No jitter - use exact backoff delay
    #[default]
    None,
    /// Random offset in `[-j, +j]` added to the delay
    Bounded(Duration),
    /// Random between 0 and delay
    Full,
    /// Random between delay/2 and delay
    Equal,
}

impl Jitter {
    /// Symmetric jitter of at most `bound` either side of the delay.
    pub fn bounded(bound: Duration) -> Self {
        if bound.is_zero() {
            Jitter::None
        } else {
            Jitter::Bounded(bound)
        }
    }

    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// Apply jitter to a delay duration
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = as_millis_saturated(delay);
        match self {
            Jitter::None => delay,
            Jitter::Bounded(bound) => {
                let bound = as_millis_saturated(*bound).min(i64::MAX as u64) as i64;
                let offset = rng.random_range(-bound..=bound);
                let jittered = if offset >= 0 {
                    millis.saturating_add(offset as u64)
                } else {
                    millis.saturating_sub(offset.unsigned_abs())
                };
                Duration::from_millis(jittered)
            }
            Jitter::Full if millis == 0 => Duration::ZERO,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal if millis == 0 => Duration::ZERO,
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

fn as_millis_saturated(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_is_identity() {
        let delay = Duration::from_millis(123);
        assert_eq!(Jitter::None.apply(delay), delay);
    }

    #[test]
    fn bounded_stays_within_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let jitter = Jitter::bounded(Duration::from_millis(200));
        for _ in 0..1_000 {
            let d = jitter.apply_with_rng(Duration::from_millis(1_000), &mut rng);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1_200), "{d:?}");
        }
    }

    #[test]
    fn bounded_never_goes_negative() {
        let mut rng = StdRng::seed_from_u64(11);
        let jitter = Jitter::bounded(Duration::from_millis(500));
        for _ in 0..1_000 {
            let d = jitter.apply_with_rng(Duration::from_millis(100), &mut rng);
            assert!(d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn zero_bound_collapses_to_none() {
        assert_eq!(Jitter::bounded(Duration::ZERO), Jitter::None);
    }

    #[test]
    fn full_and_equal_ranges() {
        let mut rng = StdRng::seed_from_u64(42);
        let delay = Duration::from_millis(100);
        for _ in 0..500 {
            assert!(Jitter::Full.apply_with_rng(delay, &mut rng) <= delay);
            let eq = Jitter::Equal.apply_with_rng(delay, &mut rng);
            assert!(eq >= Duration::from_millis(50) && eq <= delay);
        }
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
    }
}
