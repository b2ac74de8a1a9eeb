//! Axum WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;

use super::connection::run_connection;
use crate::app_state::AppState;
use crate::error::ApiError;

/// STOMP sub-protocols offered during the upgrade, most recent first.
pub const STOMP_PROTOCOLS: [&str; 3] = ["v12.stomp", "v11.stomp", "v10.stomp"];

/// `GET /ws`: upgrade HTTP connection to WebSocket.
///
/// # Errors
///
/// Returns [`ApiError::ShuttingDown`] once the relay has stopped accepting
/// sessions.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.relay.is_accepting() {
        return Err(ApiError::ShuttingDown);
    }
    let relay = Arc::clone(&state.relay);
    let idle_timeout = state.idle_timeout;

    Ok(ws
        .protocols(STOMP_PROTOCOLS)
        .on_upgrade(move |socket| run_connection(socket, relay, idle_timeout)))
}
