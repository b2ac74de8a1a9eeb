//! System endpoint DTOs.

use serde::Serialize;
use utoipa::ToSchema;

/// Health check response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `"healthy"` while accepting sessions, `"draining"` during shutdown.
    pub status: String,
    /// Telemetry service name.
    pub service: String,
    /// Deployment environment label.
    pub environment: String,
    /// Crate version.
    pub version: String,
    /// RFC 3339 timestamp of the check.
    pub timestamp: String,
    /// Number of registered sessions.
    pub connections: usize,
}
