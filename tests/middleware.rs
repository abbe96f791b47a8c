mod common;

use catflap::{
    Admission, AdmissionEvent, Clock, ClockSleeper, Declarations, Fallback, InMemoryTokenStore, ManualClock,
    MemorySink, RateLimit, RateLimitLayer, RouteContext,
};
use common::test_helpers::Hairball;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};

type Req = RouteContext<u32>;

fn admission(clock: &ManualClock, sink: &MemorySink) -> Arc<Admission<InMemoryTokenStore>> {
    Arc::new(
        Admission::builder(InMemoryTokenStore::new())
            .clock(Arc::new(clock.clone()))
            .sleeper(Arc::new(ClockSleeper::new(clock.clone())))
            .sink(sink.clone())
            .build(),
    )
}

#[tokio::test]
async fn layer_waits_then_serves() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let decls: Declarations<Req, u32, Hairball> =
        Declarations::none().method(RateLimit::new().limit(2.0).capacity(1.0).timeout(Duration::from_secs(1)));
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(admission(&clock, &sink), decls))
        .service(service_fn(|req: Req| async move { Ok::<_, Hairball>(req.payload * 2) }));

    assert_eq!(svc.clone().oneshot(RouteContext::with_payload("/yarn", 1)).await.unwrap(), 2);
    assert_eq!(svc.oneshot(RouteContext::with_payload("/yarn", 2)).await.unwrap(), 4);
    assert_eq!(clock.now_millis(), 500);
    assert_eq!(
        sink.events(),
        vec![
            AdmissionEvent::Admitted { key: "yarn".into(), attempts: 1 },
            AdmissionEvent::Denied { key: "yarn".into(), wait: Duration::from_millis(500) },
            AdmissionEvent::Admitted { key: "yarn".into(), attempts: 2 },
        ]
    );
}

#[tokio::test]
async fn layer_falls_back_without_calling_inner() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let decls: Declarations<Req, u32, Hairball> = Declarations::none().method(
        RateLimit::new()
            .capacity(1.0)
            .timeout(Duration::ZERO)
            .fallback(Fallback::new(|_: Duration, req: &Req| {
                let fallback = req.payload + 100;
                async move { Ok(fallback) }
            })),
    );
    let inner = {
        let calls = calls.clone();
        service_fn(move |req: Req| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Hairball>(req.payload) }
        })
    };
    let svc = ServiceBuilder::new().layer(RateLimitLayer::new(admission(&clock, &sink), decls)).service(inner);

    assert_eq!(svc.clone().oneshot(RouteContext::with_payload("/yarn", 1)).await.unwrap(), 1);
    assert_eq!(svc.oneshot(RouteContext::with_payload("/yarn", 2)).await.unwrap(), 102);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(sink.events().contains(&AdmissionEvent::FallbackInvoked { key: "yarn".into() }));
}

#[tokio::test]
async fn inner_errors_surface_as_inner() {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let decls: Declarations<Req, u32, Hairball> = Declarations::none();
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(admission(&clock, &sink), decls))
        .service(service_fn(|_: Req| async { Err::<u32, _>(Hairball) }));

    let err = svc.oneshot(RouteContext::with_payload("/yarn", 0)).await.unwrap_err();
    assert_eq!(err.into_inner(), Some(Hairball));
}
