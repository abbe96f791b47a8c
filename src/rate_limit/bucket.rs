use crate::clock::Clock;
use crate::error::StoreError;
use crate::rate_limit::store::{BucketShape, BucketState, TokenStore};
use crate::rate_limit::{Bucket, Decision};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Compare-and-set rounds before a consume gives up with [`StoreError::Contention`].
pub const MAX_CAS_ATTEMPTS: usize = 16;

/// Slack for float rounding when comparing refilled tokens to demand.
const EPSILON: f64 = 1e-9;

/// Wait reported for a demand the bucket can never hold.
pub const NEVER: Duration = Duration::from_millis(u64::MAX);

/// A Token Bucket rate limiter.
///
/// Replenishes tokens at a fixed `rate` per second, up to `capacity`. A
/// bucket nobody has consumed from yet is full.
pub struct TokenBucket<S> {
    store: Arc<S>,
    key: String,
    requested: BucketShape,
    shape: OnceCell<BucketShape>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
}

impl<S> std::fmt::Debug for TokenBucket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("key", &self.key)
            .field("requested", &self.requested)
            .field("shape", &self.shape.get())
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl<S> TokenBucket<S>
where
    S: TokenStore,
{
    /// Create a bucket handle for `key`.
    ///
    /// `shape` is only a request: if the store already holds a shape for
    /// `key`, that one is used.
    pub fn new(
        store: Arc<S>,
        key: impl Into<String>,
        shape: BucketShape,
        clock: Arc<dyn Clock>,
        store_timeout: Option<Duration>,
    ) -> Self {
        Self { store, key: key.into(), requested: shape, shape: OnceCell::new(), clock, store_timeout }
    }

    /// The shape in effect for this key, registering ours if none exists.
    pub async fn shape(&self) -> Result<BucketShape, StoreError> {
        self.shape
            .get_or_try_init(|| self.guarded(self.store.shape_or_insert(&self.key, self.requested)))
            .await
            .copied()
    }

    /// Tokens available right now, without consuming.
    pub async fn available(&self) -> Result<f64, StoreError> {
        let shape = self.shape().await?;
        let state = self.guarded(self.store.get_state(&self.key)).await?;
        Ok(refill(state, shape, self.clock.now_millis()))
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .unwrap_or(Err(StoreError::TimedOut(limit))),
            None => op.await,
        }
    }
}

/// Tokens in the bucket at `now`, capped at capacity.
fn refill(state: Option<BucketState>, shape: BucketShape, now: u64) -> f64 {
    match state {
        None => shape.capacity,
        Some(s) => {
            let elapsed_secs = now.saturating_sub(s.updated_at_millis) as f64 / 1_000.0;
            (s.tokens + elapsed_secs * shape.rate).min(shape.capacity)
        }
    }
}

/// Time until `deficit` tokens accrue, rounded up to whole milliseconds so a
/// caller sleeping exactly this long finds the tokens there.
fn wait_for(deficit: f64, rate: f64) -> Duration {
    let millis = (deficit * 1_000.0 / rate).ceil();
    if !millis.is_finite() || millis >= u64::MAX as f64 {
        return NEVER;
    }
    Duration::from_millis((millis as u64).max(1))
}

#[async_trait]
impl<S> Bucket for TokenBucket<S>
where
    S: TokenStore + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    async fn consume(&self, tokens: f64) -> Result<Decision, StoreError> {
        let shape = self.shape().await?;
        if tokens > shape.capacity + EPSILON {
            tracing::warn!(key = %self.key, tokens, capacity = shape.capacity, "demand exceeds stored bucket capacity");
            return Ok(Decision::Denied { wait: NEVER });
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_millis();
            let current = self.guarded(self.store.get_state(&self.key)).await?;
            let available = refill(current, shape, now);

            if available + EPSILON < tokens {
                let wait = wait_for(tokens - available, shape.rate);
                tracing::trace!(key = %self.key, available, tokens, wait_ms = wait.as_millis() as u64, "bucket short");
                return Ok(Decision::Denied { wait });
            }

            let remaining = (available - tokens).max(0.0);
            let expected = current.map(|s| s.version);
            let next = BucketState {
                tokens: remaining,
                updated_at_millis: current.map_or(now, |s| now.max(s.updated_at_millis)),
                version: expected.map_or(0, |v| v.wrapping_add(1)),
            };
            if self.guarded(self.store.compare_and_set(&self.key, next, expected)).await? {
                return Ok(Decision::Allowed { remaining });
            }
            tracing::trace!(key = %self.key, "lost compare-and-set race; re-reading bucket");
        }

        Err(StoreError::Contention { attempts: MAX_CAS_ATTEMPTS })
    }
}
