mod common;

use catflap::{
    AdmissionError, AdmissionEvent, BucketKey, CancelSignal, Clock, ConfigError, Declarations,
    Fallback, RateLimit, RouteContext,
};
use common::test_helpers::{manual_admission, Hairball};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Decls = Declarations<RouteContext<&'static str>, String, Hairball>;

fn strict() -> RateLimit<RouteContext<&'static str>, String, Hairball> {
    RateLimit::new().limit(1.0).capacity(1.0).timeout(Duration::ZERO)
}

#[tokio::test]
async fn exhaustion_without_fallback_is_rate_limited() {
    let (admission, _clock, sink) = manual_admission();
    let decls: Decls = Declarations::none().method(strict());
    let ctx = RouteContext::with_payload("/nap/spot", "tom");

    admission.admit(&decls, &ctx, || async { Ok("first".to_string()) }).await.unwrap();
    let err = admission.admit(&decls, &ctx, || async { Ok("second".to_string()) }).await.unwrap_err();

    assert!(err.is_rate_limited());
    assert_eq!(err.to_string(), "rate limit exceeded");
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, AdmissionEvent::Exhausted { key, attempts: 1, .. } if key == "nap:spot")));
}

#[tokio::test]
async fn one_second_budget_does_not_sleep_a_one_second_wait() {
    let (admission, clock, sink) = manual_admission();
    let decls: Decls = Declarations::none().method(
        RateLimit::new().limit(1.0).capacity(1.0).demand(1.0).timeout(Duration::from_secs(1)),
    );
    let ctx = RouteContext::with_payload("/sunbeam", "tom");

    admission.admit(&decls, &ctx, || async { Ok("first".to_string()) }).await.unwrap();
    let err = admission.admit(&decls, &ctx, || async { Ok("second".to_string()) }).await.unwrap_err();

    assert!(matches!(err, AdmissionError::RateLimited { wait } if wait == Duration::from_secs(1)));
    assert_eq!(clock.now_millis(), 0);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, AdmissionEvent::Exhausted { attempts: 1, .. })));
}

#[tokio::test]
async fn demand_above_an_existing_buckets_capacity_fails_fast() {
    let (admission, clock, _sink) = manual_admission();
    let shared = || BucketKey::literal("food-bowl");
    let small: Decls = Declarations::none().method(strict().bucket_key(shared()));
    let big: Decls = Declarations::none().method(
        RateLimit::new()
            .limit(1.0)
            .capacity(5.0)
            .demand(3.0)
            .timeout(Duration::from_secs(30))
            .bucket_key(shared()),
    );
    let ctx = RouteContext::with_payload("/kibble", "tom");

    admission.admit(&small, &ctx, || async { Ok(String::new()) }).await.unwrap();
    let err = admission.admit(&big, &ctx, || async { Ok(String::new()) }).await.unwrap_err();

    match err {
        AdmissionError::Configuration(e) => {
            assert_eq!(e, ConfigError::DemandExceedsCapacity { demand: 3.0, capacity: 1.0 })
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    assert_eq!(clock.now_millis(), 0);
}

#[tokio::test]
async fn fallback_result_is_the_outcome() {
    let (admission, _clock, _sink) = manual_admission();
    let fallback = Fallback::new(|wait: Duration, ctx: &RouteContext<&'static str>| {
        let who = ctx.payload;
        async move { Ok(format!("{who}: come back in {}ms", wait.as_millis())) }
    });
    let decls: Decls = Declarations::none().class(strict()).method(RateLimit::new().fallback(fallback));
    let ctx = RouteContext::with_payload("/nap/spot", "tom");

    admission.admit(&decls, &ctx, || async { Ok("napping".to_string()) }).await.unwrap();
    let out = admission.admit(&decls, &ctx, || async { Ok("napping".to_string()) }).await.unwrap();
    assert_eq!(out, "tom: come back in 1000ms");
}

#[tokio::test]
async fn deny_then_wait_then_admit() {
    let (admission, clock, sink) = manual_admission();
    let decls: Decls = Declarations::none()
        .method(RateLimit::new().limit(3.0).capacity(3.0).demand(2.0).timeout(Duration::from_secs(1)));
    let ctx = RouteContext::with_payload("/kibble", "tom");

    admission.admit(&decls, &ctx, || async { Ok("a".to_string()) }).await.unwrap();
    // one token left, need two: 1/3 s of refill
    admission.admit(&decls, &ctx, || async { Ok("b".to_string()) }).await.unwrap();
    assert_eq!(clock.now_millis(), 334);
    assert_eq!(sink.denial_waits("kibble"), vec![Duration::from_millis(334)]);
}

#[tokio::test]
async fn configuration_errors_skip_the_call() {
    let (admission, _clock, _sink) = manual_admission();
    let calls = AtomicUsize::new(0);
    let ctx = RouteContext::with_payload("/kibble", "tom");

    for (decl, expected) in [
        (strict().limit(0.0), ConfigError::NonPositive { field: "limit", value: 0.0 }),
        (strict().capacity(-1.0), ConfigError::NonPositive { field: "capacity", value: -1.0 }),
        (strict().demand(3.0), ConfigError::DemandExceedsCapacity { demand: 3.0, capacity: 1.0 }),
    ] {
        let decls: Decls = Declarations::none().method(decl);
        let err = admission
            .admit(&decls, &ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(String::new())
            })
            .await
            .unwrap_err();
        match err {
            AdmissionError::Configuration(e) => assert_eq!(e, expected),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn custom_key_resolver_uses_context() {
    let (admission, _clock, _sink) = manual_admission();
    let per_cat = BucketKey::custom(|ctx: &RouteContext<&'static str>| format!("cat:{}", ctx.payload));
    let decls: Decls = Declarations::none().method(strict().bucket_key(per_cat));

    let tom = RouteContext::with_payload("/kibble", "tom");
    let felix = RouteContext::with_payload("/kibble", "felix");
    admission.admit(&decls, &tom, || async { Ok(String::new()) }).await.unwrap();
    admission.admit(&decls, &felix, || async { Ok(String::new()) }).await.unwrap();
    assert!(admission.admit(&decls, &tom, || async { Ok(String::new()) }).await.is_err());

    for key in ["cat:tom", "cat:felix"] {
        let bucket = admission.registry().build(key, 1.0, 1.0, Duration::ZERO);
        assert_eq!(bucket.available().await.unwrap(), 0.0);
    }
    assert_eq!(admission.registry().len(), 2);
}

#[tokio::test]
async fn inner_error_is_passed_through() {
    let (admission, _clock, _sink) = manual_admission();
    let decls: Decls = Declarations::none().method(strict());
    let ctx = RouteContext::with_payload("/kibble", "tom");

    let err = admission.admit(&decls, &ctx, || async { Err(Hairball) }).await.unwrap_err();
    assert!(err.is_inner());
    assert_eq!(std::error::Error::source(&err).map(|e| e.to_string()), Some("hairball".into()));
}

#[tokio::test(start_paused = true)]
async fn cancelled_waiter_never_runs_the_call() {
    let admission = Arc::new(catflap::Admission::builder(catflap::InMemoryTokenStore::new()).build());
    let decls: Arc<Decls> = Arc::new(
        Declarations::none().method(RateLimit::new().limit(1.0).capacity(1.0).timeout(Duration::from_secs(60))),
    );
    let ctx = RouteContext::with_payload("/kibble", "tom");
    admission.admit(decls.as_ref(), &ctx, || async { Ok(String::new()) }).await.unwrap();

    let (handle, signal) = CancelSignal::pair();
    let ran = Arc::new(AtomicUsize::new(0));
    let task = {
        let (admission, decls, ran) = (admission.clone(), decls.clone(), ran.clone());
        tokio::spawn(async move {
            admission
                .admit_with_cancel(decls.as_ref(), &ctx, &signal, || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(String::new())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    assert!(matches!(task.await.unwrap(), Err(AdmissionError::Cancelled)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
