//! Telemetry capability.
//!
//! The relay reports what it does through a [`Recorder`] it is handed at
//! construction and leaves export to whatever consumes the recorder's
//! output. [`TracingRecorder`] writes events to the `tracing` pipeline;
//! [`MemoryRecorder`] keeps them in memory for assertions.

pub mod event;
pub mod recorder;

pub use event::{EventKind, TelemetryEvent};
pub use recorder::{MemoryRecorder, Recorder, TracingRecorder};
