//! Admission entry point: resolve, key, acquire, then run or fall back.
//!
//! [`Admission::admit`] is the one call a guarded operation goes through:
//!
//! 1. merge the call site's [`Declarations`] with config and defaults into a
//!    [`RateLimitPolicy`](crate::policy::RateLimitPolicy) (validation errors
//!    return before anything else happens),
//! 2. resolve the bucket key from the call context,
//! 3. get the bucket for that key from the shared [`BucketRegistry`],
//! 4. let the [`RetryCoordinator`] acquire `demand` tokens within `timeout`,
//! 5. run the protected call, or the fallback, or reject.
//!
//! ```rust
//! use std::time::Duration;
//! use catflap::{Admission, Declarations, InMemoryTokenStore, RateLimit, RouteContext};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let admission = Admission::builder(InMemoryTokenStore::new()).build();
//! let decls: Declarations<RouteContext, &str, std::io::Error> = Declarations::none()
//!     .method(RateLimit::new().limit(10.0).capacity(10.0).timeout(Duration::ZERO));
//!
//! let ctx = RouteContext::new("/litter/scoop");
//! let out = admission.admit(&decls, &ctx, || async { Ok("scooped") }).await;
//! assert_eq!(out.unwrap(), "scooped");
//! # });
//! ```

use crate::backoff::FailureBackoff;
use crate::clock::{Clock, MonotonicClock, SystemClock};
use crate::config::ConfigSource;
use crate::error::{AdmissionError, ConfigError};
use crate::fallback;
use crate::key::{resolve_key, CallContext};
use crate::policy::{PolicyDefaults, PolicyResolver, RateLimit};
use crate::rate_limit::{BucketRegistry, TokenStore};
use crate::retry::{Acquisition, CancelSignal, RetryCoordinator};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{AdmissionEvent, SinkHandle, TelemetrySink};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// The class-scope and method-scope declarations for one call site.
pub struct Declarations<C: ?Sized, T, E> {
    class: Option<RateLimit<C, T, E>>,
    method: Option<RateLimit<C, T, E>>,
}

impl<C: ?Sized, T, E> Declarations<C, T, E> {
    /// No declarations; the policy comes from config and defaults alone.
    pub fn none() -> Self {
        Self { class: None, method: None }
    }

    pub fn class(mut self, decl: RateLimit<C, T, E>) -> Self {
        self.class = Some(decl);
        self
    }

    pub fn method(mut self, decl: RateLimit<C, T, E>) -> Self {
        self.method = Some(decl);
        self
    }
}

impl<C: ?Sized, T, E> Default for Declarations<C, T, E> {
    fn default() -> Self {
        Self::none()
    }
}

impl<C: ?Sized, T, E> Clone for Declarations<C, T, E> {
    fn clone(&self) -> Self {
        Self { class: self.class.clone(), method: self.method.clone() }
    }
}

impl<C: ?Sized, T, E> fmt::Debug for Declarations<C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Declarations").field("class", &self.class).field("method", &self.method).finish()
    }
}

/// Shared admission state: one per process (or per store).
pub struct Admission<S> {
    resolver: PolicyResolver,
    registry: BucketRegistry<S>,
    coordinator: RetryCoordinator,
}

impl<S> fmt::Debug for Admission<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("resolver", &self.resolver)
            .field("registry", &self.registry)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl<S> Admission<S>
where
    S: TokenStore + 'static,
{
    pub fn builder(store: S) -> AdmissionBuilder<S> {
        AdmissionBuilder::new(store)
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &BucketRegistry<S> {
        &self.registry
    }

    /// Live global configuration; [`ConfigSource::replace`] takes effect on
    /// the next call.
    pub fn config(&self) -> &ConfigSource {
        self.resolver.config()
    }

    /// Guard `proceed` with the policy resolved for `decls`.
    ///
    /// `proceed` runs at most once, and only after tokens were taken.
    pub async fn admit<C, T, E, F, Fut>(
        &self,
        decls: &Declarations<C, T, E>,
        ctx: &C,
        proceed: F,
    ) -> Result<T, AdmissionError<E>>
    where
        C: CallContext + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(decls, ctx, None, proceed).await
    }

    /// Like [`admit`](Self::admit), but gives up with
    /// [`AdmissionError::Cancelled`] once `cancel` fires during a wait.
    pub async fn admit_with_cancel<C, T, E, F, Fut>(
        &self,
        decls: &Declarations<C, T, E>,
        ctx: &C,
        cancel: &CancelSignal,
        proceed: F,
    ) -> Result<T, AdmissionError<E>>
    where
        C: CallContext + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(decls, ctx, Some(cancel), proceed).await
    }

    async fn run<C, T, E, F, Fut>(
        &self,
        decls: &Declarations<C, T, E>,
        ctx: &C,
        cancel: Option<&CancelSignal>,
        proceed: F,
    ) -> Result<T, AdmissionError<E>>
    where
        C: CallContext + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.resolver.resolve(decls.class.as_ref(), decls.method.as_ref())?;
        let key = resolve_key(policy.bucket_key(), ctx)?;
        let bucket = self.registry.build(&key, policy.limit(), policy.capacity(), policy.timeout());
        // The key may already be shaped by another policy; a store failure here is left to the retry loop.
        if let Ok(shape) = bucket.shape().await {
            if policy.demand() > shape.capacity {
                return Err(ConfigError::DemandExceedsCapacity {
                    demand: policy.demand(),
                    capacity: shape.capacity,
                }
                .into());
            }
        }

        match self.coordinator.acquire(bucket.as_ref(), policy.demand(), policy.timeout(), cancel).await {
            Acquisition::Admitted { .. } => proceed().await.map_err(AdmissionError::Inner),
            Acquisition::Exhausted { wait, .. } => {
                if policy.fallback().is_some() {
                    self.coordinator.sink().emit(AdmissionEvent::FallbackInvoked { key }).await;
                }
                fallback::dispatch(policy.fallback(), wait, ctx).await
            }
            Acquisition::Cancelled { .. } => Err(AdmissionError::Cancelled),
        }
    }
}

/// Builder for [`Admission`].
pub struct AdmissionBuilder<S> {
    store: S,
    defaults: PolicyDefaults,
    config: ConfigSource,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    failure_backoff: FailureBackoff,
    sink: SinkHandle,
}

impl<S> AdmissionBuilder<S>
where
    S: TokenStore + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            defaults: PolicyDefaults::default(),
            config: ConfigSource::empty(),
            clock: None,
            sleeper: None,
            failure_backoff: FailureBackoff::default(),
            sink: SinkHandle::default(),
        }
    }

    pub fn defaults(mut self, defaults: PolicyDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn config(mut self, config: ConfigSource) -> Self {
        self.config = config;
        self
    }

    /// Time source for both refill math and retry deadlines.
    ///
    /// Without one, buckets use wall-clock milliseconds so processes sharing
    /// a store agree on refill, while deadlines use a monotonic clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn failure_backoff(mut self, backoff: FailureBackoff) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn sink<K>(mut self, sink: K) -> Self
    where
        K: TelemetrySink + Sync,
        K::Future: Send + 'static,
    {
        self.sink = SinkHandle::new(sink);
        self
    }

    pub fn build(self) -> Admission<S> {
        let (bucket_clock, deadline_clock): (Arc<dyn Clock>, Arc<dyn Clock>) = match self.clock {
            Some(clock) => (clock.clone(), clock),
            None => (Arc::new(SystemClock), Arc::new(MonotonicClock::default())),
        };
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let coordinator = RetryCoordinator::new(deadline_clock, sleeper)
            .with_failure_backoff(self.failure_backoff)
            .with_sink(self.sink);
        Admission {
            resolver: PolicyResolver::new(self.defaults, self.config),
            registry: BucketRegistry::with_clock(self.store, bucket_clock),
            coordinator,
        }
    }
}
