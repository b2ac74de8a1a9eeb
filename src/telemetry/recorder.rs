//! Recording interface and its implementations.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use super::{EventKind, TelemetryEvent};

/// Sink for relay telemetry.
///
/// Held by the relay as `Arc<dyn Recorder>`. Implementations must not block:
/// `record` is called on the fan-out path.
pub trait Recorder: Send + Sync + fmt::Debug {
    /// Records one event.
    fn record(&self, event: TelemetryEvent);
}

/// Writes events to the `tracing` pipeline under the `telemetry` target.
///
/// Each event carries the `service.name` and `deployment.environment`
/// resource attributes so a downstream subscriber or collector can attribute
/// it. Failures are logged at `WARN`, session lifecycle at `INFO` and frame
/// traffic at `DEBUG`.
#[derive(Debug, Clone)]
pub struct TracingRecorder {
    service_name: String,
    environment: String,
}

impl TracingRecorder {
    /// Creates a recorder stamping events with the given resource attributes.
    #[must_use]
    pub fn new(service_name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            environment: environment.into(),
        }
    }
}

macro_rules! emit {
    ($level:ident, $self:ident, $event:ident) => {
        tracing::$level!(
            target: "telemetry",
            event = $event.kind.name(),
            service.name = %$self.service_name,
            deployment.environment = %$self.environment,
            connection.id = %$event.connection_id,
            destination = $event.destination.as_deref(),
            command = $event.command.map(|c| c.as_str()),
            duration_ms = $event.duration.map(|d| d.as_millis() as u64),
            detail = $event.detail.as_deref(),
            timestamp = %$event.timestamp.to_rfc3339(),
        )
    };
}

impl Recorder for TracingRecorder {
    fn record(&self, event: TelemetryEvent) {
        match event.kind {
            kind if kind.is_failure() => emit!(warn, self, event),
            EventKind::ConnectionOpen | EventKind::ConnectionClose => emit!(info, self, event),
            _ => emit!(debug, self, event),
        }
    }
}

/// Keeps every event in memory, in record order.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the recorded events of one kind.
    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Returns how many events of one kind were recorded.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Forgets all recorded events.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
