//! Convenient re-exports for common Catflap types.
pub use crate::{
    admission::{Admission, Declarations},
    error::{AdmissionError, ConfigError},
    fallback::Fallback,
    key::{BucketKey, CallContext, RouteContext},
    policy::RateLimit,
    rate_limit::{InMemoryTokenStore, RateLimitLayer, TokenStore},
    retry::CancelSignal,
};
