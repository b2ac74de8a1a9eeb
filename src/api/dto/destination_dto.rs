//! Destination listing DTOs.

use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::{ConnectionId, DestinationSummary};

/// Response body for `GET /api/v1/destinations`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DestinationListResponse {
    /// Live destinations, sorted by name.
    pub data: Vec<DestinationSummary>,
    /// Number of destinations.
    pub total: usize,
}

/// Response body for `GET /api/v1/destinations/{name}`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DestinationDetailResponse {
    /// Destination name.
    pub name: String,
    /// Subscribers in fan-out order.
    #[schema(value_type = Vec<String>)]
    pub subscribers: Vec<ConnectionId>,
}
