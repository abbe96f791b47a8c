use catflap::{Admission, ClockSleeper, InMemoryTokenStore, ManualClock, MemorySink};
use std::sync::Arc;

/// Protected-call error used across integration tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Hairball;

impl std::fmt::Display for Hairball {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("hairball")
    }
}

impl std::error::Error for Hairball {}

/// Admission over an in-memory store where sleeping advances a manual clock,
/// so waits take no real time.
pub fn manual_admission() -> (Admission<InMemoryTokenStore>, ManualClock, MemorySink) {
    let clock = ManualClock::new();
    let sink = MemorySink::new();
    let admission = Admission::builder(InMemoryTokenStore::new())
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(ClockSleeper::new(clock.clone())))
        .sink(sink.clone())
        .build();
    (admission, clock, sink)
}
