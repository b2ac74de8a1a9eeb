//! Telemetry events emitted by the relay.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{Command, ConnectionId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// A session was registered.
    #[serde(rename = "connection.open")]
    ConnectionOpen,
    /// A session was removed; carries the session duration.
    #[serde(rename = "connection.close")]
    ConnectionClose,
    /// An inbound frame was parsed.
    #[serde(rename = "frame.received")]
    FrameReceived,
    /// An outbound frame was queued for a connection.
    #[serde(rename = "frame.delivered")]
    FrameDelivered,
    /// An outbound frame could not be queued for a connection.
    #[serde(rename = "frame.delivery_failed")]
    FrameDeliveryFailed,
    /// An inbound frame violated the protocol.
    #[serde(rename = "frame.rejected")]
    FrameRejected,
}

impl EventKind {
    /// Returns the dotted event name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ConnectionOpen => "connection.open",
            Self::ConnectionClose => "connection.close",
            Self::FrameReceived => "frame.received",
            Self::FrameDelivered => "frame.delivered",
            Self::FrameDeliveryFailed => "frame.delivery_failed",
            Self::FrameRejected => "frame.rejected",
        }
    }

    /// Returns `true` for kinds that report a failure.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::FrameDeliveryFailed | Self::FrameRejected)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One telemetry record with its context attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryEvent {
    /// Event name.
    pub kind: EventKind,
    /// Session the event belongs to.
    pub connection_id: ConnectionId,
    /// Destination involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Frame command involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Duration of the timed operation (session lifetime for close events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Failure reason or other free-form context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl TelemetryEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, connection_id: ConnectionId) -> Self {
        Self {
            kind,
            connection_id,
            destination: None,
            command: None,
            timestamp: Utc::now(),
            duration: None,
            detail: None,
        }
    }

    /// Attaches a destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Attaches a frame command.
    #[must_use]
    pub const fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command);
        self
    }

    /// Attaches a duration.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Attaches free-form context.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
