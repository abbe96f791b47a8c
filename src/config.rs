//! Process-wide `rate-limit` configuration.
//!
//! The application's configuration loader is not ours; we only read the
//! `rate-limit` namespace it hands us. Keys mirror the declaration fields:
//!
//! ```json
//! { "rate-limit": { "limit": 10, "capacity": 20, "timeout": 0.5, "demand": 1, "bucketsKey": "api" } }
//! ```
//!
//! Every key is optional and unknown keys are ignored. A key that is present
//! (even with a zero value) overrides the built-in default; it is validated
//! together with the rest of the merged policy.

use crate::adaptive::DynamicConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of the configuration namespace read by [`RateLimitConfig::from_namespace`].
pub const NAMESPACE: &str = "rate-limit";

/// Global layer of the policy merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Tokens added per second.
    pub limit: Option<f64>,
    /// Bucket size.
    pub capacity: Option<f64>,
    /// Retry budget in seconds.
    pub timeout: Option<f64>,
    /// Tokens consumed per call.
    pub demand: Option<f64>,
    /// Literal bucket key shared by every call that does not declare its own.
    #[serde(alias = "bucketsKey", alias = "bucket-key")]
    pub bucket_key: Option<String>,
}

impl RateLimitConfig {
    /// Parse the namespace object itself.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse from an application config root, reading its `rate-limit` key.
    /// A missing namespace is an empty layer.
    pub fn from_namespace(root: &serde_json::Value) -> Result<Self, ConfigError> {
        match root.get(NAMESPACE) {
            Some(ns) => Self::from_value(ns),
            None => Ok(Self::default()),
        }
    }

    pub fn limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn demand(mut self, demand: f64) -> Self {
        self.demand = Some(demand);
        self
    }

    pub fn bucket_key(mut self, key: impl Into<String>) -> Self {
        self.bucket_key = Some(key.into());
        self
    }
}

/// Shared, live-updatable handle to the global configuration.
///
/// The resolver reads one snapshot per resolution; `replace` takes effect
/// for resolutions that start afterwards.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    current: DynamicConfig<RateLimitConfig>,
}

impl ConfigSource {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { current: DynamicConfig::new(config) }
    }

    pub fn empty() -> Self {
        Self::new(RateLimitConfig::default())
    }

    pub fn from_namespace(root: &serde_json::Value) -> Result<Self, ConfigError> {
        RateLimitConfig::from_namespace(root).map(Self::new)
    }

    pub fn snapshot(&self) -> Arc<RateLimitConfig> {
        self.current.snapshot()
    }

    pub fn replace(&self, config: RateLimitConfig) {
        tracing::info!(?config, "rate-limit configuration replaced");
        self.current.set(config);
    }
}

impl Default for ConfigSource {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_the_rate_limit_namespace() {
        let root = json!({
            "app": { "name": "shop" },
            "rate-limit": { "limit": 10, "capacity": 20, "timeout": 0.5, "bucketsKey": "api" }
        });
        let cfg = RateLimitConfig::from_namespace(&root).unwrap();
        assert_eq!(cfg.limit, Some(10.0));
        assert_eq!(cfg.capacity, Some(20.0));
        assert_eq!(cfg.timeout, Some(0.5));
        assert_eq!(cfg.demand, None);
        assert_eq!(cfg.bucket_key.as_deref(), Some("api"));
    }

    #[test]
    fn missing_namespace_is_empty() {
        let cfg = RateLimitConfig::from_namespace(&json!({ "other": 1 })).unwrap();
        assert_eq!(cfg, RateLimitConfig::default());
        let cfg = RateLimitConfig::from_value(&serde_json::Value::Null).unwrap();
        assert_eq!(cfg, RateLimitConfig::default());
    }

    #[test]
    fn unknown_keys_are_ignored_and_bad_types_rejected() {
        let cfg = RateLimitConfig::from_value(&json!({ "capacity": 3, "redis": "x" })).unwrap();
        assert_eq!(cfg.capacity, Some(3.0));

        let err = RateLimitConfig::from_value(&json!({ "limit": "fast" })).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn snake_case_key_is_accepted() {
        let cfg = RateLimitConfig::from_value(&json!({ "bucket_key": "k" })).unwrap();
        assert_eq!(cfg.bucket_key.as_deref(), Some("k"));
    }

    #[test]
    fn source_replacement_does_not_touch_old_snapshots() {
        let source = ConfigSource::new(RateLimitConfig::default().capacity(5.0));
        let before = source.snapshot();
        source.replace(RateLimitConfig::default().capacity(9.0));
        assert_eq!(before.capacity, Some(5.0));
        assert_eq!(source.snapshot().capacity, Some(9.0));
    }
}
