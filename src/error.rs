//! Relay error types.
//!
//! - [`ProtocolError`]: a client violated the frame protocol. Fatal for the
//!   originating connection only.
//! - [`DeliveryError`]: one subscriber could not be written to during
//!   fan-out. Never propagates past the fan-out loop.
//! - [`ConfigError`]: start-up configuration is invalid. Fatal for the
//!   process.
//! - [`ApiError`]: HTTP API failures, mapped to a status code and a
//!   structured JSON body.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{Command, ConnectionId};

/// Frame protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame other than CONNECT arrived before the session was opened.
    #[error("CONNECT required before other frames")]
    NotConnected,

    /// The client sent a server-only command.
    #[error("command {0} is not accepted from clients")]
    UnexpectedCommand(Command),

    /// The connection is not registered, or has already been closed.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

impl ProtocolError {
    /// Returns `true` if the relay closes the connection for this error.
    ///
    /// Only [`ProtocolError::UnknownConnection`] is not fatal, as there is
    /// no live connection left to close.
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::UnknownConnection(_))
    }
}

/// Per-subscriber delivery failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The subscriber's transport is gone (outbox receiver dropped).
    #[error("transport closed for connection {0}")]
    TransportFailure(ConnectionId),

    /// The subscriber's outbox stayed full for longer than the write bound.
    #[error("write to connection {0} timed out after {1:?}")]
    Timeout(ConnectionId, Duration),

    /// The subscriber is closing and no longer accepts deliveries.
    #[error("connection {0} is closing")]
    Closing(ConnectionId),
}

impl DeliveryError {
    /// Returns the connection the delivery was addressed to.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        match self {
            Self::TransportFailure(id) | Self::Timeout(id, _) | Self::Closing(id) => *id,
        }
    }
}

/// Invalid start-up configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `LISTEN_ADDR` is not a socket address.
    #[error("invalid listen address `{value}`: {source}")]
    InvalidListenAddr {
        /// Raw value.
        value: String,
        /// Parse failure.
        #[source]
        source: std::net::AddrParseError,
    },

    /// A variable holds a value that cannot be parsed.
    #[error("invalid value `{value}` for {key}")]
    InvalidValue {
        /// Environment variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// A destination route entry is not of the form `from=to`.
    #[error("invalid route `{0}`: expected from=to with non-empty names")]
    InvalidRoute(String),
}

/// Structured JSON error response body.
///
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "destination not found: /topic/none"
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
}

/// HTTP API error with status code mapping.
///
/// | Range     | Category        | HTTP Status               |
/// |-----------|-----------------|---------------------------|
/// | 2000–2999 | Not Found       | 404 Not Found             |
/// | 3000–3999 | Server          | 500 / 503                 |
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No destination with the given name has subscribers.
    #[error("destination not found: {0}")]
    DestinationNotFound(String),

    /// The relay is draining and refuses new sessions.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::DestinationNotFound(_) => 2001,
            Self::Internal(_) => 3000,
            Self::ShuttingDown => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::DestinationNotFound(_) => StatusCode::NOT_FOUND,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
