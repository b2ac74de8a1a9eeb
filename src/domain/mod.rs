//! Domain layer: frames, sessions and destination bookkeeping.
//!
//! This module contains the relay's data model: connection identity, the
//! text frame protocol, per-session state with its outbound queue, the
//! destination → subscriber table and the static route table.

pub mod connection;
pub mod connection_id;
pub mod destination;
pub mod frame;
pub mod routes;

pub use connection::{
    CloseReason, Connection, ConnectionState, Outbound, Outbox, OutboxReceiver,
};
pub use connection_id::ConnectionId;
pub use destination::{DestinationSummary, DestinationTable};
pub use frame::{Command, Frame};
pub use routes::DestinationRoutes;
