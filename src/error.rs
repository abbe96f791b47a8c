//! Error types for admission control
use std::fmt;
use std::time::Duration;

/// The bucket store could not be reached, read, or written.
///
/// Always transient from the admission layer's point of view: the retry
/// coordinator folds it into its wait/retry cycle exactly like a denial.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend is down or refused the operation.
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),
    /// The backend did not answer within the bucket's store deadline.
    #[error("bucket store timed out after {0:?}")]
    TimedOut(Duration),
    /// Optimistic updates kept losing to concurrent writers.
    #[error("bucket state contended; gave up after {attempts} compare-and-set attempts")]
    Contention { attempts: usize },
}

/// A policy or key that cannot be used, detected before any token is consumed.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `limit`, `capacity` or `demand` resolved to zero, a negative number, or a non-finite value.
    #[error("rate-limit field `{field}` must be a positive number (got {value})")]
    NonPositive { field: &'static str, value: f64 },
    /// `timeout` resolved to a negative or non-finite number of seconds.
    #[error("rate-limit timeout must be a non-negative number of seconds (got {0})")]
    InvalidTimeout(f64),
    /// A single call would need more tokens than the bucket can ever hold.
    #[error("rate-limit demand {demand} exceeds bucket capacity {capacity}")]
    DemandExceedsCapacity { demand: f64, capacity: f64 },
    /// No key was declared and the route path derives to nothing.
    #[error("cannot derive a bucket key from route path {path:?}")]
    EmptyBucketKey { path: String },
    /// The `rate-limit` configuration namespace could not be parsed.
    #[error("invalid rate-limit configuration: {0}")]
    Parse(String),
}

/// Unified error returned by the admission entry point.
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The retry budget ran out and no fallback was configured.
    RateLimited { wait: Duration },
    /// The resolved policy or bucket key was unusable; the protected call never ran.
    Configuration(ConfigError),
    /// The caller's task was cancelled while waiting for tokens.
    Cancelled,
    /// The protected call (or the fallback) failed on its own terms.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { .. } => write!(f, "rate limit exceeded"),
            Self::Configuration(e) => write!(f, "rate-limit configuration error: {}", e),
            Self::Cancelled => write!(f, "admission cancelled while waiting for tokens"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Configuration(e) => Some(e),
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<ConfigError> for AdmissionError<E> {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e)
    }
}

impl<E> AdmissionError<E> {
    /// Check if the caller was throttled.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Check if the policy or key failed validation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
    /// Check if the wait was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// The last wait the bucket asked for, for `Retry-After` style hints.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[test]
    fn rate_limited_display_is_plain() {
        let err: AdmissionError<io::Error> =
            AdmissionError::RateLimited { wait: Duration::from_millis(250) };
        assert_eq!(err.to_string(), "rate limit exceeded");
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn configuration_error_exposes_source() {
        let err: AdmissionError<io::Error> =
            ConfigError::EmptyBucketKey { path: "/".into() }.into();
        assert!(err.is_configuration());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("bucket key"));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let limited: AdmissionError<io::Error> =
            AdmissionError::RateLimited { wait: Duration::ZERO };
        assert!(limited.is_rate_limited());
        assert!(!limited.is_cancelled());
        let cancelled: AdmissionError<io::Error> = AdmissionError::Cancelled;
        assert!(cancelled.is_cancelled());
        assert!(cancelled.retry_after().is_none());
        let inner = AdmissionError::Inner(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(inner.is_inner());
        assert_eq!(inner.as_inner().map(|e| e.to_string()), Some("boom".to_string()));
        assert_eq!(inner.to_string(), "boom");
    }

    #[test]
    fn store_error_messages() {
        assert!(StoreError::TimedOut(Duration::from_secs(1)).to_string().contains("timed out"));
        assert!(StoreError::Contention { attempts: 16 }.to_string().contains("16"));
        assert!(StoreError::Unavailable("redis down".into()).to_string().contains("redis down"));
    }
}
