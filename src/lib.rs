//! # ws-stomp-relay
//!
//! Instrumented WebSocket relay for a small STOMP-style text frame protocol.
//!
//! Clients connect over WebSocket, open a session with `CONNECT`,
//! `SUBSCRIBE` to named destinations and `SEND` bodies to them. The relay
//! fans every SEND out to the destination's current subscribers and reports
//! each session, frame and failure through a telemetry [`telemetry::Recorder`].
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket, HTTP)
//!     │
//!     ├── WS Handler (ws/)          one task per session
//!     ├── REST Handlers (api/)      health, destination introspection
//!     │
//!     ├── Relay (service/)          frames, subscriptions, fan-out
//!     │     ├── Frame / DestinationTable / DestinationRoutes (domain/)
//!     │     └── Recorder (telemetry/)
//!     │
//!     └── Telemetry consumer (tracing pipeline)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod telemetry;
pub mod ws;
