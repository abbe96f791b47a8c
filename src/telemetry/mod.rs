//! Telemetry for the admission pipeline.
//!
//! The retry coordinator and the admission entry point emit
//! [`AdmissionEvent`]s describing each decision. Events flow through
//! [`TelemetrySink`] implementations, which are `tower::Service`s so they
//! compose like any other service. Emission is best effort: a failing sink
//! never affects an admission decision.

pub mod events;
pub mod sinks;

pub use events::AdmissionEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, SinkHandle, TelemetrySink};
