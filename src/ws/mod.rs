//! WebSocket transport: upgrade handling and the per-session loop.
//!
//! The endpoint at `/ws` carries the text frame protocol. Each upgraded
//! socket runs one task that feeds inbound messages to the relay and drains
//! the session's outbox back to the socket.

pub mod connection;
pub mod handler;
