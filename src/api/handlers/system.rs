//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;

use crate::api::dto::HealthResponse;
use crate::app_state::AppState;

/// `GET /health`: service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns relay status, service identity, version, current timestamp and the number of live sessions.",
    responses(
        (status = 200, description = "Relay is accepting sessions", body = HealthResponse),
        (status = 503, description = "Relay is draining", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let accepting = state.relay.is_accepting();
    let status = if accepting {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if accepting { "healthy" } else { "draining" }.to_string(),
            service: state.service_name.to_string(),
            environment: state.environment.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            connections: state.relay.connection_count().await,
        }),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
