use super::events::AdmissionEvent;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Type-erased sink shared by the admission pipeline.
#[derive(Clone)]
pub struct SinkHandle {
    emit: Arc<dyn Fn(AdmissionEvent) -> BoxFuture<'static, ()> + Send + Sync>,
}

impl SinkHandle {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        Self {
            emit: Arc::new(move |event: AdmissionEvent| -> BoxFuture<'static, ()> {
                Box::pin(emit_best_effort(sink.clone(), event))
            }),
        }
    }

    pub async fn emit(&self, event: AdmissionEvent) {
        (self.emit)(event).await
    }
}

impl Default for SinkHandle {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SinkHandle(<sink>)")
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes each event as a structured `tracing` record.
///
/// Level follows what the event means for the caller: waits and admissions
/// at debug, rejections and fallbacks at info, store failures at warn.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

fn millis(wait: Duration) -> u64 {
    u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
}

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Admitted { key, attempts } => {
                tracing::debug!(key = %key, attempts, "admission granted");
            }
            AdmissionEvent::Denied { key, wait } => {
                tracing::debug!(key = %key, wait_ms = millis(*wait), "admission denied");
            }
            AdmissionEvent::StorageFailure { key, error, wait } => {
                tracing::warn!(key = %key, %error, backoff_ms = millis(*wait), "bucket store failure");
            }
            AdmissionEvent::Exhausted { key, attempts, wait } => {
                tracing::info!(key = %key, attempts, retry_after_ms = millis(*wait), "rate limited");
            }
            AdmissionEvent::FallbackInvoked { key } => {
                tracing::info!(key = %key, "fallback answered");
            }
            AdmissionEvent::Cancelled { key } => {
                tracing::debug!(key = %key, "admission cancelled");
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent admission events in memory.
///
/// Bounded: once `capacity` events are held, each new one evicts the oldest.
/// Useful in tests to assert the wait schedule a caller went through.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AdmissionEvent>> {
        self.events.lock().expect("memory sink lock poisoned")
    }

    /// All retained events, oldest first.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Retained events for one bucket key.
    pub fn for_key(&self, key: &str) -> Vec<AdmissionEvent> {
        self.lock().iter().filter(|e| e.key() == key).cloned().collect()
    }

    /// Waits the bucket reported for `key`, in order. Each one is a sleep the
    /// caller took or a budget it ran out of.
    pub fn denial_waits(&self, key: &str) -> Vec<Duration> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                AdmissionEvent::Denied { key: k, wait } if k == key => Some(*wait),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}
