//! Backoff applied when the bucket store fails.
//!
//! A storage failure carries no wait-time signal, so the retry coordinator
//! needs its own delay. Delays grow exponentially with the number of
//! consecutive failures, saturate at `max`, and may use equal jitter
//! (uniform in `[delay/2, delay]`) so a fleet of waiters does not hammer a
//! recovering store in lockstep.
//!
//! ```rust
//! use std::time::Duration;
//! use catflap::FailureBackoff;
//!
//! let backoff = FailureBackoff::new(Duration::from_millis(50), Duration::from_millis(400))
//!     .unwrap()
//!     .without_jitter();
//! assert_eq!(backoff.delay(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay(2), Duration::from_millis(100));
//! assert_eq!(backoff.delay(9), Duration::from_millis(400));
//! ```

use rand::{rng, Rng};
use std::time::Duration;

/// Default first delay after a storage failure.
pub const DEFAULT_FAILURE_BASE: Duration = Duration::from_millis(50);
/// Default ceiling for storage-failure delays.
pub const DEFAULT_FAILURE_MAX: Duration = Duration::from_secs(1);

/// Errors returned by backoff configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    #[error("base delay must be greater than zero")]
    BaseMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
}

/// Exponential, capped delay for consecutive storage failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl FailureBackoff {
    pub fn new(base: Duration, max: Duration) -> Result<Self, BackoffError> {
        if base.is_zero() {
            return Err(BackoffError::BaseMustBePositive);
        }
        if max < base {
            return Err(BackoffError::MaxLessThanBase { base, max });
        }
        Ok(Self { base, max, jitter: true })
    }

    /// Use the exact exponential delay; handy for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt after `failures` consecutive storage
    /// failures (1-based). Never returns zero.
    pub fn delay(&self, failures: usize) -> Duration {
        let exponent = failures.saturating_sub(1).min(31) as u32;
        let nanos = self.base.as_nanos().saturating_mul(1u128 << exponent);
        let capped = Duration::from_nanos(nanos.min(self.max.as_nanos()) as u64);
        if !self.jitter {
            return capped;
        }
        let millis = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        let half = millis / 2;
        let jittered = rng().random_range(half..=millis);
        Duration::from_millis(jittered.max(1))
    }
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self { base: DEFAULT_FAILURE_BASE, max: DEFAULT_FAILURE_MAX, jitter: true }
    }
}
