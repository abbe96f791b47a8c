use std::fmt;
use std::time::Duration;

/// Events emitted while a call waits for admission.
///
/// Every event names the bucket key it concerns, so a sink can aggregate
/// per route.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// Tokens were taken and the protected call will run.
    Admitted {
        key: String,
        /// Consume attempts it took, including the successful one.
        attempts: usize,
    },
    /// Not enough tokens; the caller will sleep `wait` if the budget allows.
    Denied { key: String, wait: Duration },
    /// The store failed; treated like a denial with a backoff wait.
    StorageFailure { key: String, error: String, wait: Duration },
    /// The retry budget ran out.
    Exhausted { key: String, attempts: usize, wait: Duration },
    /// A configured fallback answered instead of the protected call.
    FallbackInvoked { key: String },
    /// The waiting task was cancelled.
    Cancelled { key: String },
}

impl AdmissionEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Admitted { key, .. }
            | Self::Denied { key, .. }
            | Self::StorageFailure { key, .. }
            | Self::Exhausted { key, .. }
            | Self::FallbackInvoked { key }
            | Self::Cancelled { key } => key,
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admitted { key, attempts } => {
                write!(f, "Admitted({}, attempts={})", key, attempts)
            }
            Self::Denied { key, wait } => write!(f, "Denied({}, wait={:?})", key, wait),
            Self::StorageFailure { key, error, wait } => {
                write!(f, "StorageFailure({}, error={}, wait={:?})", key, error, wait)
            }
            Self::Exhausted { key, attempts, wait } => {
                write!(f, "Exhausted({}, attempts={}, wait={:?})", key, attempts, wait)
            }
            Self::FallbackInvoked { key } => write!(f, "FallbackInvoked({})", key),
            Self::Cancelled { key } => write!(f, "Cancelled({})", key),
        }
    }
}
