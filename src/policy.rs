//! Layered policy resolution.
//!
//! An effective [`RateLimitPolicy`] is built field by field from four layers,
//! lowest precedence first:
//!
//! 1. built-in [`PolicyDefaults`],
//! 2. the global `rate-limit` configuration ([`ConfigSource`]),
//! 3. the class-scope [`RateLimit`] declaration,
//! 4. the method-scope [`RateLimit`] declaration.
//!
//! A declaration only overrides the fields it sets. The merged result is
//! validated once, here, so nothing downstream sees a half-configured policy.
//!
//! ```rust
//! use catflap::{ConfigSource, PolicyDefaults, PolicyResolver, RateLimit, RateLimitConfig};
//!
//! let resolver = PolicyResolver::new(
//!     PolicyDefaults::default(),
//!     ConfigSource::new(RateLimitConfig::default().capacity(5.0)),
//! );
//! let class: RateLimit<str, (), std::io::Error> = RateLimit::new().limit(2.0);
//! let method = RateLimit::new();
//! let policy = resolver.resolve(Some(&class), Some(&method)).unwrap();
//! assert_eq!((policy.limit(), policy.capacity()), (2.0, 5.0));
//! ```

use crate::config::{ConfigSource, RateLimitConfig};
use crate::error::ConfigError;
use crate::fallback::Fallback;
use crate::key::BucketKey;
use std::fmt;
use std::time::Duration;

/// Lowest merge layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDefaults {
    pub limit: f64,
    pub capacity: f64,
    pub timeout: Duration,
    pub demand: f64,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self { limit: 1.0, capacity: 1.0, timeout: Duration::from_secs(1), demand: 1.0 }
    }
}

/// A call-site declaration. Unset fields fall through to lower layers.
pub struct RateLimit<C: ?Sized, T, E> {
    limit: Option<f64>,
    capacity: Option<f64>,
    timeout: Option<Duration>,
    demand: Option<f64>,
    bucket_key: Option<BucketKey<C>>,
    fallback: Option<Fallback<C, T, E>>,
}

impl<C: ?Sized, T, E> RateLimit<C, T, E> {
    pub fn new() -> Self {
        Self {
            limit: None,
            capacity: None,
            timeout: None,
            demand: None,
            bucket_key: None,
            fallback: None,
        }
    }

    /// Tokens added per second.
    pub fn limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Bucket size.
    pub fn capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Total time allowed for waiting and retrying. Zero means one attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tokens consumed per call.
    pub fn demand(mut self, demand: f64) -> Self {
        self.demand = Some(demand);
        self
    }

    pub fn bucket_key(mut self, key: BucketKey<C>) -> Self {
        self.bucket_key = Some(key);
        self
    }

    pub fn fallback(mut self, fallback: Fallback<C, T, E>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl<C: ?Sized, T, E> Default for RateLimit<C, T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized, T, E> Clone for RateLimit<C, T, E> {
    fn clone(&self) -> Self {
        Self {
            limit: self.limit,
            capacity: self.capacity,
            timeout: self.timeout,
            demand: self.demand,
            bucket_key: self.bucket_key.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<C: ?Sized, T, E> fmt::Debug for RateLimit<C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .field("demand", &self.demand)
            .field("bucket_key", &self.bucket_key)
            .field("fallback", &self.fallback.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

/// Fully resolved, validated throttling parameters for one call.
pub struct RateLimitPolicy<C: ?Sized, T, E> {
    limit: f64,
    capacity: f64,
    timeout: Duration,
    demand: f64,
    bucket_key: BucketKey<C>,
    fallback: Option<Fallback<C, T, E>>,
}

impl<C: ?Sized, T, E> RateLimitPolicy<C, T, E> {
    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn demand(&self) -> f64 {
        self.demand
    }

    pub fn bucket_key(&self) -> &BucketKey<C> {
        &self.bucket_key
    }

    pub fn fallback(&self) -> Option<&Fallback<C, T, E>> {
        self.fallback.as_ref()
    }
}

impl<C: ?Sized, T, E> Clone for RateLimitPolicy<C, T, E> {
    fn clone(&self) -> Self {
        Self {
            limit: self.limit,
            capacity: self.capacity,
            timeout: self.timeout,
            demand: self.demand,
            bucket_key: self.bucket_key.clone(),
            fallback: self.fallback.clone(),
        }
    }
}

impl<C: ?Sized, T, E> fmt::Debug for RateLimitPolicy<C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("limit", &self.limit)
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .field("demand", &self.demand)
            .field("bucket_key", &self.bucket_key)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Merges the four layers into one policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    defaults: PolicyDefaults,
    config: ConfigSource,
}

impl PolicyResolver {
    pub fn new(defaults: PolicyDefaults, config: ConfigSource) -> Self {
        Self { defaults, config }
    }

    pub fn config(&self) -> &ConfigSource {
        &self.config
    }

    /// Resolve the effective policy for a call site. Either declaration may
    /// be absent.
    pub fn resolve<C: ?Sized, T, E>(
        &self,
        class: Option<&RateLimit<C, T, E>>,
        method: Option<&RateLimit<C, T, E>>,
    ) -> Result<RateLimitPolicy<C, T, E>, ConfigError> {
        let config = self.config.snapshot();
        let merged = merge(&self.defaults, &config, class, method);
        let policy = merged.validate()?;
        tracing::trace!(?policy, "resolved rate-limit policy");
        Ok(policy)
    }
}

/// Merge state before validation. The timeout keeps the conversion error of
/// an unusable config value until a declaration overrides it.
struct Merged<C: ?Sized, T, E> {
    limit: f64,
    capacity: f64,
    timeout: Result<Duration, ConfigError>,
    demand: f64,
    bucket_key: BucketKey<C>,
    fallback: Option<Fallback<C, T, E>>,
}

fn merge<C: ?Sized, T, E>(
    defaults: &PolicyDefaults,
    config: &RateLimitConfig,
    class: Option<&RateLimit<C, T, E>>,
    method: Option<&RateLimit<C, T, E>>,
) -> Merged<C, T, E> {
    let mut merged = Merged {
        limit: config.limit.unwrap_or(defaults.limit),
        capacity: config.capacity.unwrap_or(defaults.capacity),
        timeout: match config.timeout {
            Some(secs) => {
                Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidTimeout(secs))
            }
            None => Ok(defaults.timeout),
        },
        demand: config.demand.unwrap_or(defaults.demand),
        bucket_key: match &config.bucket_key {
            Some(key) if !key.is_empty() => BucketKey::Literal(key.clone()),
            _ => BucketKey::Derived,
        },
        fallback: None,
    };

    for decl in [class, method].into_iter().flatten() {
        if let Some(limit) = decl.limit {
            merged.limit = limit;
        }
        if let Some(capacity) = decl.capacity {
            merged.capacity = capacity;
        }
        if let Some(timeout) = decl.timeout {
            merged.timeout = Ok(timeout);
        }
        if let Some(demand) = decl.demand {
            merged.demand = demand;
        }
        if let Some(key) = decl.bucket_key.as_ref().filter(|k| k.is_set()) {
            merged.bucket_key = key.clone();
        }
        if let Some(fallback) = &decl.fallback {
            merged.fallback = Some(fallback.clone());
        }
    }

    merged
}

impl<C: ?Sized, T, E> Merged<C, T, E> {
    fn validate(self) -> Result<RateLimitPolicy<C, T, E>, ConfigError> {
        positive("limit", self.limit)?;
        positive("capacity", self.capacity)?;
        positive("demand", self.demand)?;
        if self.demand > self.capacity {
            return Err(ConfigError::DemandExceedsCapacity {
                demand: self.demand,
                capacity: self.capacity,
            });
        }
        let timeout = self.timeout?;

        Ok(RateLimitPolicy {
            limit: self.limit,
            capacity: self.capacity,
            timeout,
            demand: self.demand,
            bucket_key: self.bucket_key,
            fallback: self.fallback,
        })
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}
