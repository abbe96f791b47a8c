//! Token-bucket primitives.
//!
//! - [`Bucket`]: the consume-or-tell-me-how-long-to-wait contract the retry
//!   coordinator drives.
//! - [`Decision`]: the outcome of a single consume.
//!
//! # Architecture
//!
//! - **Logic**: [`TokenBucket`](bucket::TokenBucket) does the refill math.
//! - **Storage**: [`TokenStore`](store::TokenStore) holds bucket state per key,
//!   so the same logic runs against memory or a shared backend. All state
//!   changes go through compare-and-set, which is what keeps concurrent
//!   consumers from spending the same tokens twice.
//! - **Registry**: [`BucketRegistry`](store::BucketRegistry) hands out one
//!   bucket handle per key.
//! - **Middleware**: [`RateLimitLayer`] guards a tower service with the full
//!   admission pipeline.

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub mod bucket;
pub mod middleware;
pub mod store;
pub use bucket::TokenBucket;
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{BucketRegistry, BucketShape, BucketState, InMemoryTokenStore, TokenStore};

/// The decision returned by a single consume.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The tokens were taken.
    Allowed {
        /// Tokens left after this consume.
        remaining: f64,
    },
    /// Not enough tokens.
    Denied {
        /// How long until enough tokens will have accrued for this demand.
        /// Always greater than zero.
        wait: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// The wait carried by a denial.
    pub fn wait(&self) -> Option<Duration> {
        match self {
            Decision::Denied { wait } => Some(*wait),
            Decision::Allowed { .. } => None,
        }
    }
}

/// Anything the retry coordinator can consume tokens from.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Identity of the bucket, for logs and telemetry.
    fn key(&self) -> &str;

    /// Atomically take `tokens` if available.
    async fn consume(&self, tokens: f64) -> Result<Decision, StoreError>;
}
