mod common;

use catflap::{Admission, Declarations, InMemoryTokenStore, ManualClock, RateLimit, RouteContext, TrackingSleeper};
use catflap::rate_limit::{Bucket, BucketRegistry};
use common::test_helpers::Hairball;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CAPACITY: usize = 8;
const TASKS: usize = 64;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_consumers_never_exceed_capacity() {
    // frozen clock: no refill during the test
    let clock = ManualClock::new();
    let registry = Arc::new(BucketRegistry::with_clock(InMemoryTokenStore::new(), Arc::new(clock)));

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let bucket = registry.build("shared", 1.0, CAPACITY as f64, Duration::ZERO);
            bucket.consume(1.0).await
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        // Contention is a storage failure, never an admission.
        if let Ok(decision) = handle.await.unwrap() {
            if decision.is_allowed() {
                allowed += 1;
            }
        }
    }
    assert!(allowed <= CAPACITY, "admitted {allowed} with capacity {CAPACITY}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_run_at_most_capacity_calls() {
    let clock = ManualClock::new();
    let admission = Arc::new(
        Admission::builder(InMemoryTokenStore::new())
            .clock(Arc::new(clock))
            .sleeper(Arc::new(TrackingSleeper::new()))
            .build(),
    );
    let decls: Arc<Declarations<RouteContext, (), Hairball>> = Arc::new(
        Declarations::none().method(
            RateLimit::new().limit(1.0).capacity(CAPACITY as f64).timeout(Duration::from_millis(250)),
        ),
    );
    let ran = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(TASKS);
    for _ in 0..TASKS {
        let (admission, decls, ran) = (admission.clone(), decls.clone(), ran.clone());
        handles.push(tokio::spawn(async move {
            let ctx = RouteContext::new("/food/bowl");
            admission
                .admit(decls.as_ref(), &ctx, || async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }

    let mut limited = 0;
    for handle in handles {
        if let Err(err) = handle.await.unwrap() {
            assert!(err.is_rate_limited());
            limited += 1;
        }
    }
    assert_eq!(ran.load(Ordering::SeqCst), CAPACITY);
    assert_eq!(limited, TASKS - CAPACITY);
}
