//! Bucket identity.
//!
//! Calls that resolve to the same key share one bucket and therefore one
//! quota. A key comes from, in order: a custom resolver, a literal, or the
//! call's route path (`/orders/list/` becomes `orders:list`).

use crate::error::ConfigError;
use std::fmt;
use std::sync::Arc;

/// What the admission layer needs to know about the call being guarded.
pub trait CallContext: Send + Sync {
    /// Route path of the request, e.g. `/api/orders`.
    fn route_path(&self) -> &str;
}

/// Ready-made context: a route path plus whatever the protected call or a
/// fallback needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteContext<P = ()> {
    pub path: String,
    pub payload: P,
}

impl RouteContext<()> {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), payload: () }
    }
}

impl<P> RouteContext<P> {
    pub fn with_payload(path: impl Into<String>, payload: P) -> Self {
        Self { path: path.into(), payload }
    }
}

impl<P: Send + Sync> CallContext for RouteContext<P> {
    fn route_path(&self) -> &str {
        &self.path
    }
}

impl CallContext for str {
    fn route_path(&self) -> &str {
        self
    }
}

impl CallContext for String {
    fn route_path(&self) -> &str {
        self
    }
}

impl<T: CallContext + ?Sized> CallContext for &T {
    fn route_path(&self) -> &str {
        (**self).route_path()
    }
}

/// Where a call's bucket key comes from.
pub enum BucketKey<C: ?Sized> {
    /// Derive from the route path.
    Derived,
    /// Fixed key.
    Literal(String),
    /// Computed from the call context.
    Custom(Arc<dyn Fn(&C) -> String + Send + Sync>),
}

impl<C: ?Sized> BucketKey<C> {
    pub fn literal(key: impl Into<String>) -> Self {
        Self::Literal(key.into())
    }

    pub fn custom<F>(resolver: F) -> Self
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(resolver))
    }

    /// An empty literal carries no information and counts as not set.
    pub(crate) fn is_set(&self) -> bool {
        match self {
            Self::Derived => false,
            Self::Literal(key) => !key.is_empty(),
            Self::Custom(_) => true,
        }
    }
}

impl<C: ?Sized> Clone for BucketKey<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Derived => Self::Derived,
            Self::Literal(key) => Self::Literal(key.clone()),
            Self::Custom(f) => Self::Custom(f.clone()),
        }
    }
}

impl<C: ?Sized> fmt::Debug for BucketKey<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Derived => write!(f, "Derived"),
            Self::Literal(key) => f.debug_tuple("Literal").field(key).finish(),
            Self::Custom(_) => write!(f, "Custom(<resolver>)"),
        }
    }
}

impl<C: ?Sized> Default for BucketKey<C> {
    fn default() -> Self {
        Self::Derived
    }
}

/// Resolve the storage key for one call. Never returns an empty key.
///
/// A custom resolver that yields an empty string falls through to the
/// route path, as does an empty literal.
pub fn resolve_key<C>(key: &BucketKey<C>, ctx: &C) -> Result<String, ConfigError>
where
    C: CallContext + ?Sized,
{
    match key {
        BucketKey::Custom(resolver) => {
            let resolved = resolver(ctx);
            if resolved.is_empty() {
                derive_key(ctx.route_path())
            } else {
                Ok(resolved)
            }
        }
        BucketKey::Literal(literal) if !literal.is_empty() => Ok(literal.clone()),
        _ => derive_key(ctx.route_path()),
    }
}

/// `/foo/bar/` → `foo:bar`.
pub fn derive_key(path: &str) -> Result<String, ConfigError> {
    let key = path.replace('/', ":");
    let key = key.trim_matches(':');
    if key.is_empty() {
        return Err(ConfigError::EmptyBucketKey { path: path.to_string() });
    }
    Ok(key.to_string())
}
