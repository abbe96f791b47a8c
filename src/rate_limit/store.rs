use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::rate_limit::bucket::TokenBucket;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Refill rate and size of a bucket. Fixed by whoever creates the bucket first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketShape {
    /// Tokens per second.
    pub rate: f64,
    pub capacity: f64,
}

/// Mutable bucket state as persisted by a [`TokenStore`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Clock reading of the last committed consume.
    pub updated_at_millis: u64,
    /// Incremented on every committed write; the compare-and-set token.
    pub version: u64,
}

/// Storage contract for bucket shape and state, keyed by bucket key.
///
/// Implementations may be in-process or shared between processes (e.g.
/// Redis). All three operations must be individually atomic; the bucket
/// builds its consume protocol on top of `compare_and_set`.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store `shape` for `key` unless one is already stored; return the
    /// stored shape either way.
    async fn shape_or_insert(&self, key: &str, shape: BucketShape) -> Result<BucketShape, StoreError>;

    /// Current state, or `None` if nothing has been committed for `key` yet.
    async fn get_state(&self, key: &str) -> Result<Option<BucketState>, StoreError>;

    /// Write `next` only if the stored version is still `expected_version`
    /// (`None`: no state stored yet).
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        next: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S: TokenStore + ?Sized> TokenStore for Arc<S> {
    async fn shape_or_insert(&self, key: &str, shape: BucketShape) -> Result<BucketShape, StoreError> {
        (**self).shape_or_insert(key, shape).await
    }

    async fn get_state(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        (**self).get_state(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        next: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_set(key, next, expected_version).await
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    shape: Option<BucketShape>,
    state: Option<BucketState>,
}

/// Simple in-memory token store.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with a stored shape or state.
    pub fn len(&self) -> usize {
        self.data.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_data<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> Result<R, StoreError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory token store lock poisoned".into()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn shape_or_insert(&self, key: &str, shape: BucketShape) -> Result<BucketShape, StoreError> {
        self.with_data(|data| {
            let entry =
                data.entry(key.to_string()).or_insert(Entry { shape: None, state: None });
            *entry.shape.get_or_insert(shape)
        })
    }

    async fn get_state(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        self.with_data(|data| data.get(key).and_then(|e| e.state))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        next: BucketState,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.with_data(|data| {
            let entry =
                data.entry(key.to_string()).or_insert(Entry { shape: None, state: None });
            let current = entry.state.map(|s| s.version);
            if current != expected_version {
                return false;
            }
            entry.state = Some(next);
            true
        })
    }
}

/// Hands out one [`TokenBucket`] per key over a shared store.
///
/// Bucket handles are cached for the life of the registry; the shape that
/// reaches the store first wins, so a later `build` with a different rate or
/// capacity gets the existing bucket unchanged.
pub struct BucketRegistry<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Arc<TokenBucket<S>>>>,
}

impl<S> std::fmt::Debug for BucketRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketRegistry")
            .field("clock", &self.clock)
            .field("buckets", &self.len())
            .finish()
    }
}

impl<S> BucketRegistry<S> {
    /// Number of cached bucket handles.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S> BucketRegistry<S>
where
    S: TokenStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Buckets created by this registry read time from `clock`.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store: Arc::new(store), clock, buckets: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get or create the bucket for `key`.
    ///
    /// `timeout` bounds each store round trip the bucket makes; zero means
    /// no bound.
    pub fn build(&self, key: &str, rate: f64, capacity: f64, timeout: Duration) -> Arc<TokenBucket<S>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }
        let store_timeout = (!timeout.is_zero()).then_some(timeout);
        let bucket = Arc::new(TokenBucket::new(
            self.store.clone(),
            key,
            BucketShape { rate, capacity },
            self.clock.clone(),
            store_timeout,
        ));
        tracing::debug!(key, rate, capacity, "created token bucket");
        buckets.insert(key.to_string(), bucket.clone());
        bucket
    }

}
