//! Bounded wait-and-retry around a token bucket.
//!
//! The coordinator turns a single "not enough tokens" answer into a
//! cooperative protocol: consume, and if denied sleep for exactly the wait
//! the bucket reported, then try again, until the policy's time budget is
//! spent.
//!
//! Semantics:
//! - The deadline is fixed once, at `now + timeout`, before the first attempt.
//! - A wait is only slept if `now + wait < deadline` (strict). A wait that
//!   would land on or past the deadline ends the loop instead, so the budget
//!   is never overrun.
//! - `timeout == 0` therefore means exactly one attempt and no sleep.
//! - A storage failure is handled like a denial. It carries no wait of its
//!   own, so the delay comes from [`FailureBackoff`], growing with the number
//!   of consecutive failures.
//! - Sleeps go through the injected [`Sleeper`], which suspends only the
//!   calling task.
//! - A [`CancelSignal`] firing during a sleep ends the loop with
//!   [`Acquisition::Cancelled`]; no further consume is made.
//!
//! Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use catflap::{Acquisition, BucketRegistry, ClockSleeper, InMemoryTokenStore, ManualClock, RetryCoordinator};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let clock = ManualClock::new();
//! let registry = BucketRegistry::with_clock(InMemoryTokenStore::new(), Arc::new(clock.clone()));
//! let bucket = registry.build("reports", 1.0, 1.0, Duration::ZERO);
//! let coordinator = RetryCoordinator::new(Arc::new(clock.clone()), Arc::new(ClockSleeper::new(clock)));
//!
//! let first = coordinator.acquire(bucket.as_ref(), 1.0, Duration::from_secs(5), None).await;
//! assert!(matches!(first, Acquisition::Admitted { attempts: 1 }));
//! // The bucket is empty; the coordinator sleeps one second and gets the refilled token.
//! let second = coordinator.acquire(bucket.as_ref(), 1.0, Duration::from_secs(5), None).await;
//! assert!(matches!(second, Acquisition::Admitted { attempts: 2 }));
//! # });
//! ```

use crate::backoff::FailureBackoff;
use crate::clock::{Clock, MonotonicClock};
use crate::rate_limit::{Bucket, Decision};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{AdmissionEvent, SinkHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Why the coordinator is about to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCause {
    /// The bucket did not have enough tokens.
    Denied,
    /// The store failed; the wait is a backoff, not a bucket estimate.
    StorageFailure,
}

/// States of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting,
    Waiting { wait: Duration, cause: WaitCause },
    Succeeded,
    Exhausted { wait: Duration },
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted { .. })
    }
}

/// Decide what follows a `Waiting { wait }` state observed at `now_millis`.
///
/// Returns `true` if the wait fits strictly inside the budget.
pub fn fits_budget(now_millis: u64, wait: Duration, deadline_millis: u64) -> bool {
    let wait_millis = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
    now_millis.saturating_add(wait_millis) < deadline_millis
}

/// Final outcome of [`RetryCoordinator::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Tokens were taken.
    Admitted { attempts: usize },
    /// The budget ran out; `wait` is the last wait that did not fit.
    Exhausted { wait: Duration, attempts: usize },
    /// The caller cancelled while waiting.
    Cancelled { attempts: usize },
}

/// Sender half of a cancellation pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiver half of a cancellation pair; cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Drives consume attempts against one bucket within a time budget.
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    failure_backoff: FailureBackoff,
    sink: SinkHandle,
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(MonotonicClock::default()), Arc::new(TokioSleeper))
    }
}

impl RetryCoordinator {
    pub fn new(clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { clock, sleeper, failure_backoff: FailureBackoff::default(), sink: SinkHandle::default() }
    }

    pub fn with_failure_backoff(mut self, backoff: FailureBackoff) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sink = sink;
        self
    }

    pub(crate) fn sink(&self) -> &SinkHandle {
        &self.sink
    }

    /// Acquire `demand` tokens from `bucket`, waiting at most `timeout` in total.
    pub async fn acquire<B>(
        &self,
        bucket: &B,
        demand: f64,
        timeout: Duration,
        cancel: Option<&CancelSignal>,
    ) -> Acquisition
    where
        B: Bucket + ?Sized,
    {
        let key = bucket.key();
        let timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let deadline = self.clock.now_millis().saturating_add(timeout_millis);
        let mut attempts = 0usize;
        let mut failures = 0usize;
        let mut state = AttemptState::Attempting;

        loop {
            state = match state {
                AttemptState::Attempting => {
                    attempts += 1;
                    match bucket.consume(demand).await {
                        Ok(Decision::Allowed { remaining }) => {
                            tracing::debug!(key, attempts, remaining, "admitted");
                            AttemptState::Succeeded
                        }
                        Ok(Decision::Denied { wait }) => {
                            failures = 0;
                            tracing::debug!(key, attempts, wait_ms = wait.as_millis() as u64, "denied");
                            self.sink.emit(AdmissionEvent::Denied { key: key.to_string(), wait }).await;
                            AttemptState::Waiting { wait, cause: WaitCause::Denied }
                        }
                        Err(error) => {
                            failures += 1;
                            let wait = self.failure_backoff.delay(failures);
                            tracing::warn!(
                                key,
                                attempts,
                                failures,
                                wait_ms = wait.as_millis() as u64,
                                %error,
                                "bucket store failure; backing off"
                            );
                            self.sink
                                .emit(AdmissionEvent::StorageFailure {
                                    key: key.to_string(),
                                    error: error.to_string(),
                                    wait,
                                })
                                .await;
                            AttemptState::Waiting { wait, cause: WaitCause::StorageFailure }
                        }
                    }
                }
                AttemptState::Waiting { wait, cause } => {
                    if !fits_budget(self.clock.now_millis(), wait, deadline) {
                        AttemptState::Exhausted { wait }
                    } else {
                        tracing::trace!(key, ?cause, wait_ms = wait.as_millis() as u64, "waiting for tokens");
                        match cancel {
                            // The sleep future must not be created once cancelled.
                            Some(signal) if signal.is_cancelled() => {
                                return self.cancelled(key, attempts).await;
                            }
                            Some(signal) => {
                                tokio::select! {
                                    biased;
                                    _ = signal.cancelled() => return self.cancelled(key, attempts).await,
                                    _ = self.sleeper.sleep(wait) => {}
                                }
                            }
                            None => self.sleeper.sleep(wait).await,
                        }
                        AttemptState::Attempting
                    }
                }
                AttemptState::Succeeded => {
                    self.sink.emit(AdmissionEvent::Admitted { key: key.to_string(), attempts }).await;
                    return Acquisition::Admitted { attempts };
                }
                AttemptState::Exhausted { wait } => {
                    tracing::info!(key, attempts, wait_ms = wait.as_millis() as u64, "retry budget exhausted");
                    self.sink
                        .emit(AdmissionEvent::Exhausted { key: key.to_string(), attempts, wait })
                        .await;
                    return Acquisition::Exhausted { wait, attempts };
                }
            };
        }
    }

    async fn cancelled(&self, key: &str, attempts: usize) -> Acquisition {
        tracing::debug!(key, attempts, "cancelled while waiting");
        self.sink.emit(AdmissionEvent::Cancelled { key: key.to_string() }).await;
        Acquisition::Cancelled { attempts }
    }
}
