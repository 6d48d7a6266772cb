//! Delay schedules shared by failure accrual and the retry policy.
//!
//! Attempt `0` is the initial call and never waits. Failure accrual asks for `delay(n)` where
//! `n` is how many times in a row the endpoint has been marked dead, so an exponential schedule
//! spaces out probes against an endpoint that keeps failing.
//!
//! ```rust
//! use std::time::Duration;
//! use dispatchline::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(8), Duration::from_secs(1));
//! ```

use std::time::Duration;
use thiserror::Error;

/// Upper bound applied to every computed delay (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("with_max is only valid for exponential backoff")]
    MaxRequiresExponential,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Delay schedule indexed by attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Backoff {
    /// Same delay for every attempt after the first.
    Constant(Duration),
    /// `base * 2^(attempt - 1)`, optionally capped at `max`.
    Exponential { base: Duration, max: Option<Duration> },
}

impl Backoff {
    /// Never wait.
    pub const fn none() -> Self {
        Self::Constant(Duration::ZERO)
    }

    pub const fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    pub const fn exponential(base: Duration) -> Self {
        Self::Exponential { base, max: None }
    }

    /// Cap an exponential schedule.
    pub fn with_max(self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match self {
            Self::Exponential { base, .. } if max < base => {
                Err(BackoffError::MaxLessThanBase { base, max })
            }
            Self::Exponential { base, .. } => Ok(Self::Exponential { base, max: Some(max) }),
            Self::Constant(_) => Err(BackoffError::MaxRequiresExponential),
        }
    }

    /// Delay before `attempt` (0 = initial call).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self {
            Self::Constant(delay) => *delay,
            Self::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                let grown = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map_or(grown, |m| grown.min(m))
            }
        };
        raw.min(MAX_BACKOFF)
    }

    /// Delay of the first non-initial attempt.
    pub fn initial(&self) -> Duration {
        self.delay(1)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_is_flat_after_first_attempt() {
        let backoff = Backoff::constant(Duration::from_secs(5));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn none_never_waits() {
        let backoff = Backoff::none();
        assert_eq!(backoff.delay(3), Duration::ZERO);
        assert!(backoff.initial().is_zero());
    }

    #[test]
    fn exponential_doubles() {
        let backoff = Backoff::exponential(Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(2), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(400));
    }

    #[test]
    fn exponential_respects_cap() {
        let backoff =
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::from_secs(10)).unwrap();
        assert_eq!(backoff.delay(4), Duration::from_secs(8));
        assert_eq!(backoff.delay(5), Duration::from_secs(10));
        assert_eq!(backoff.delay(usize::MAX), Duration::from_secs(10));
    }

    #[test]
    fn huge_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(10_000), MAX_BACKOFF);
    }

    #[test]
    fn with_max_validation() {
        assert_eq!(
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)),
            Err(BackoffError::MaxRequiresExponential)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1)).with_max(Duration::ZERO),
            Err(BackoffError::MaxMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(2)).with_max(Duration::from_secs(1)),
            Err(BackoffError::MaxLessThanBase { .. })
        ));
    }
}
