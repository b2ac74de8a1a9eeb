//! Shared application state injected into all Axum handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RelayConfig;
use crate::service::Relay;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The process-wide relay.
    pub relay: Arc<Relay>,
    /// Idle read timeout applied to each WebSocket session.
    pub idle_timeout: Option<Duration>,
    /// Telemetry service name, reported by the health endpoint.
    pub service_name: Arc<str>,
    /// Deployment environment label, reported by the health endpoint.
    pub environment: Arc<str>,
}

impl AppState {
    /// Builds the state for `relay` from the process configuration.
    #[must_use]
    pub fn new(relay: Arc<Relay>, config: &RelayConfig) -> Self {
        Self {
            relay,
            idle_timeout: config.idle_timeout,
            service_name: Arc::from(config.service_name.as_str()),
            environment: Arc::from(config.environment.as_str()),
        }
    }
}
