//! Service layer: the message relay.
//!
//! [`Relay`] coordinates sessions, destinations and fan-out, and reports
//! everything it does through a [`crate::telemetry::Recorder`].

pub mod relay;

pub use relay::Relay;
