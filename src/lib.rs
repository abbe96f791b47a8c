#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Catflap 🐱
//!
//! Token-bucket rate limiting for async Rust with cooperative waiting: a
//! throttled call sleeps for exactly as long as the bucket says it must,
//! retries within a time budget, and only then falls back or rejects.
//!
//! ## Features
//!
//! - **Token buckets** with continuous refill, backed by a pluggable
//!   [`TokenStore`] (in-memory included) and compare-and-set commits
//! - **Layered policies**: defaults, global config, class and method
//!   declarations merged field by field
//! - **Bucket keys** derived from the route path, given literally, or
//!   computed from the call context
//! - **Bounded retry** that never overruns the timeout, with backoff on
//!   storage failures and cooperative cancellation
//! - **Fallbacks** that answer instead of a hard rejection
//! - **Tower middleware** via [`RateLimitLayer`]
//! - **Telemetry** sinks built on `tower::Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use catflap::{Admission, Declarations, Fallback, InMemoryTokenStore, RateLimit, RouteContext};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let admission = Admission::builder(InMemoryTokenStore::new()).build();
//!
//!     // One treat per second, burst of two; wait up to 100ms, then offer a toy instead.
//!     let decls = Declarations::none().method(
//!         RateLimit::new()
//!             .limit(1.0)
//!             .capacity(2.0)
//!             .timeout(Duration::from_millis(100))
//!             .fallback(Fallback::value("toy")),
//!     );
//!
//!     let ctx = RouteContext::new("/treats");
//!     for _ in 0..3 {
//!         let got = admission
//!             .admit(&decls, &ctx, || async { Ok::<_, std::io::Error>("treat") })
//!             .await
//!             .unwrap();
//!         println!("{got}");
//!     }
//! }
//! ```

pub mod adaptive;
pub mod admission;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod fallback;
pub mod key;
pub mod policy;
pub mod prelude;
pub mod rate_limit;
pub mod retry;
pub mod sleeper;
pub mod telemetry;

// Re-exports
pub use adaptive::DynamicConfig;
pub use admission::{Admission, AdmissionBuilder, Declarations};
pub use backoff::{BackoffError, FailureBackoff};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{ConfigSource, RateLimitConfig};
pub use error::{AdmissionError, ConfigError, StoreError};
pub use fallback::Fallback;
pub use key::{derive_key, resolve_key, BucketKey, CallContext, RouteContext};
pub use policy::{PolicyDefaults, PolicyResolver, RateLimit, RateLimitPolicy};
pub use rate_limit::{
    Bucket, BucketRegistry, BucketShape, BucketState, Decision, InMemoryTokenStore,
    RateLimitLayer, RateLimitService, TokenBucket, TokenStore,
};
pub use retry::{Acquisition, AttemptState, CancelHandle, CancelSignal, RetryCoordinator, WaitCause};
pub use sleeper::{ClockSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, SinkHandle, TelemetrySink};
