//! Abstraction for the cooperative wait between acquisition attempts
//!
//! Production code parks the task on the tokio timer; tests swap in sleepers
//! that return immediately and move a [`ManualClock`] forward instead.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Suspends the calling task, never the worker thread.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that advances a [`ManualClock`] by the requested duration
/// and returns at once, so buckets reading the same clock see the refill.
#[derive(Debug, Clone)]
pub struct ClockSleeper {
    clock: ManualClock,
}

impl ClockSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock }
    }
}

impl Sleeper for ClockSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.clock.advance(duration);
        Box::pin(async {})
    }
}

/// Wraps another sleeper and records every requested duration.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    inner: Arc<dyn Sleeper>,
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    /// Track sleeps that return immediately without touching any clock.
    pub fn new() -> Self {
        Self::wrapping(NoopSleeper)
    }

    pub fn wrapping<S: Sleeper + 'static>(inner: S) -> Self {
        Self { inner: Arc::new(inner), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().expect("tracking sleeper lock poisoned").clone()
    }

    pub fn total(&self) -> Duration {
        self.calls().into_iter().sum()
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("tracking sleeper lock poisoned").push(duration);
        self.inner.sleep(duration)
    }
}

#[derive(Debug, Clone, Copy)]
struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn clock_sleeper_moves_the_clock_instead_of_waiting() {
        let clock = ManualClock::new();
        let sleeper = ClockSleeper::new(clock.clone());
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(clock.now_millis(), 30_000);
    }

    #[tokio::test]
    async fn tracking_sleeper_records_and_delegates() {
        let clock = ManualClock::new();
        let sleeper = TrackingSleeper::wrapping(ClockSleeper::new(clock.clone()));

        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(400)).await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(400)]);
        assert_eq!(sleeper.total(), Duration::from_millis(500));
        assert_eq!(clock.now_millis(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_parks_on_the_runtime_timer() {
        let sleeper = TokioSleeper;
        let start = tokio::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
