//! What happens when the retry budget runs out.

use crate::error::AdmissionError;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type FallbackFn<C, T, E> = dyn Fn(Duration, &C) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// Caller-supplied handler invoked instead of a hard rejection.
///
/// It receives the last wait the bucket asked for and the call context, and
/// produces the same `Result<T, E>` the protected call would have.
pub struct Fallback<C: ?Sized, T, E> {
    handler: Arc<FallbackFn<C, T, E>>,
}

impl<C, T, E> Fallback<C, T, E>
where
    C: ?Sized + 'static,
    T: 'static,
    E: 'static,
{
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Duration, &C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let handler = move |wait: Duration, ctx: &C| -> BoxFuture<'static, Result<T, E>> {
            Box::pin(handler(wait, ctx))
        };
        Self { handler: Arc::new(handler) }
    }

    /// Always answer with `value`.
    pub fn value(value: T) -> Self
    where
        T: Clone + Send + Sync,
        E: Send,
    {
        Self::new(move |_: Duration, _: &C| futures::future::ready(Ok(value.clone())))
    }
}

impl<C: ?Sized, T, E> Fallback<C, T, E> {
    fn call(&self, wait: Duration, ctx: &C) -> BoxFuture<'static, Result<T, E>> {
        (self.handler)(wait, ctx)
    }
}

impl<C: ?Sized, T, E> Clone for Fallback<C, T, E> {
    fn clone(&self) -> Self {
        Self { handler: self.handler.clone() }
    }
}

impl<C: ?Sized, T, E> fmt::Debug for Fallback<C, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fallback(<handler>)")
    }
}

/// Run the fallback if there is one, otherwise reject.
pub async fn dispatch<C, T, E>(
    fallback: Option<&Fallback<C, T, E>>,
    wait: Duration,
    ctx: &C,
) -> Result<T, AdmissionError<E>>
where
    C: ?Sized,
{
    match fallback {
        Some(handler) => {
            tracing::info!(wait_ms = wait.as_millis() as u64, "rate limited; invoking fallback");
            handler.call(wait, ctx).await.map_err(AdmissionError::Inner)
        }
        None => {
            tracing::info!(wait_ms = wait.as_millis() as u64, "rate limited; rejecting");
            Err(AdmissionError::RateLimited { wait })
        }
    }
}
