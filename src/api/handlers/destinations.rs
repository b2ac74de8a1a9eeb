//! Destination introspection handlers: list and detail.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{DestinationDetailResponse, DestinationListResponse};
use crate::app_state::AppState;
use crate::error::{ApiError, ErrorResponse};

/// `GET /destinations`: list live destinations.
#[utoipa::path(
    get,
    path = "/api/v1/destinations",
    tag = "Destinations",
    summary = "List destinations",
    description = "Returns every destination that currently has at least one subscriber, with its subscriber count.",
    responses(
        (status = 200, description = "Destination list", body = DestinationListResponse),
    )
)]
pub async fn list_destinations(State(state): State<AppState>) -> impl IntoResponse {
    let data = state.relay.destinations().await;
    let total = data.len();
    Json(DestinationListResponse { data, total })
}

/// `GET /destinations/{name}`: subscribers of one destination.
///
/// Destination names containing `/` must be percent-encoded
/// (`/topic/messages` → `%2Ftopic%2Fmessages`).
///
/// # Errors
///
/// Returns [`ApiError::DestinationNotFound`] if the destination has no
/// subscribers.
#[utoipa::path(
    get,
    path = "/api/v1/destinations/{name}",
    tag = "Destinations",
    summary = "Get destination subscribers",
    description = "Returns the subscribers of a destination in fan-out order.",
    params(
        ("name" = String, Path, description = "Percent-encoded destination name"),
    ),
    responses(
        (status = 200, description = "Destination found", body = DestinationDetailResponse),
        (status = 404, description = "Destination has no subscribers", body = ErrorResponse),
    )
)]
pub async fn get_destination(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let subscribers = state
        .relay
        .subscribers(&name)
        .await
        .ok_or_else(|| ApiError::DestinationNotFound(name.clone()))?;
    Ok(Json(DestinationDetailResponse { name, subscribers }))
}

/// Destination routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/destinations", get(list_destinations))
        .route("/destinations/{name}", get(get_destination))
}
