use crate::admission::{Admission, Declarations};
use crate::error::AdmissionError;
use crate::key::CallContext;
use crate::rate_limit::TokenStore;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that puts every request through [`Admission::admit`].
///
/// The request itself is the call context, so it must implement
/// [`CallContext`]; one clone of it is kept for key resolution and the
/// fallback.
pub struct RateLimitLayer<St, Req, T, E> {
    admission: Arc<Admission<St>>,
    decls: Arc<Declarations<Req, T, E>>,
}

impl<St, Req, T, E> RateLimitLayer<St, Req, T, E> {
    pub fn new(admission: Arc<Admission<St>>, decls: Declarations<Req, T, E>) -> Self {
        Self { admission, decls: Arc::new(decls) }
    }
}

impl<St, Req, T, E> Clone for RateLimitLayer<St, Req, T, E> {
    fn clone(&self) -> Self {
        Self { admission: self.admission.clone(), decls: self.decls.clone() }
    }
}

impl<St, Req, T, E> fmt::Debug for RateLimitLayer<St, Req, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("decls", &self.decls).finish()
    }
}

impl<Svc, St, Req, T, E> Layer<Svc> for RateLimitLayer<St, Req, T, E> {
    type Service = RateLimitService<Svc, St, Req, T, E>;

    fn layer(&self, service: Svc) -> Self::Service {
        RateLimitService {
            inner: service,
            admission: self.admission.clone(),
            decls: self.decls.clone(),
        }
    }
}

/// Middleware service that admits each request before calling `inner`.
pub struct RateLimitService<Svc, St, Req, T, E> {
    inner: Svc,
    admission: Arc<Admission<St>>,
    decls: Arc<Declarations<Req, T, E>>,
}

impl<Svc: Clone, St, Req, T, E> Clone for RateLimitService<Svc, St, Req, T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), admission: self.admission.clone(), decls: self.decls.clone() }
    }
}

impl<Svc: fmt::Debug, St, Req, T, E> fmt::Debug for RateLimitService<Svc, St, Req, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService").field("inner", &self.inner).field("decls", &self.decls).finish()
    }
}

impl<Svc, St, Req, T, E> Service<Req> for RateLimitService<Svc, St, Req, T, E>
where
    Svc: Service<Req, Response = T, Error = E> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    St: TokenStore + 'static,
    Req: CallContext + Clone + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Response = T;
    type Error = AdmissionError<E>;
    type Future = Pin<Box<dyn Future<Output = Result<T, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the readied service for this call and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let admission = self.admission.clone();
        let decls = self.decls.clone();

        Box::pin(async move {
            let ctx = req.clone();
            admission.admit(decls.as_ref(), &ctx, move || inner.call(req)).await
        })
    }
}
