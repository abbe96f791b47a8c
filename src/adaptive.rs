//! Live-updatable shared values.
//!
//! Readers take a snapshot and keep it for the rest of their operation, so a
//! concurrent update never tears a half-read configuration. The default
//! backend is `ArcSwap` (lock-free reads); feature `adaptive-rwlock`
//! switches to a `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared value with cheap snapshots and whole-value replacement.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Current value; later `set` calls do not affect the returned snapshot.
    pub fn snapshot(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }

    /// Derive the next value from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            let _previous = self.inner.rcu(|cur| f(&**cur));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let next = f(&guard);
            *guard = Arc::new(next);
        }
    }
}
