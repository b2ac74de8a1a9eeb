//! HTTP surface: REST handlers, DTOs, OpenAPI document and router
//! composition.
//!
//! Resource endpoints are mounted under `/api/v1`; `/health` and the
//! WebSocket endpoint `/ws` sit at the root.

pub mod dto;
pub mod handlers;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::app_state::AppState;
use crate::ws::handler::ws_handler;

/// OpenAPI document for the REST endpoints.
#[derive(Debug, OpenApi)]
#[openapi(
    info(title = "ws-stomp-relay", description = "Instrumented WebSocket/STOMP relay"),
    paths(
        handlers::system::health_handler,
        handlers::destinations::list_destinations,
        handlers::destinations::get_destination,
    ),
    components(schemas(
        dto::HealthResponse,
        dto::DestinationListResponse,
        dto::DestinationDetailResponse,
        crate::domain::DestinationSummary,
        crate::error::ErrorResponse,
        crate::error::ErrorBody,
    )),
    tags(
        (name = "System", description = "Liveness"),
        (name = "Destinations", description = "Subscription introspection"),
    )
)]
pub struct ApiDoc;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes())
}

/// Path the OpenAPI document is served at.
pub const OPENAPI_PATH: &str = "/api-docs/openapi.json";

/// Builds the full application: REST API, WebSocket endpoint, OpenAPI
/// document and middleware, bound to `state`.
pub fn build_app(state: AppState) -> Router {
    let router = Router::new()
        .merge(build_router())
        .route("/ws", get(ws_handler));

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui").url(OPENAPI_PATH, ApiDoc::openapi()),
    );
    #[cfg(not(feature = "swagger-ui"))]
    let router = router.route(
        OPENAPI_PATH,
        get(|| async { axum::Json(ApiDoc::openapi()) }),
    );

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RelayConfig;
    use crate::domain::Outbox;
    use crate::service::Relay;
    use crate::telemetry::MemoryRecorder;

    fn app() -> (Router, Arc<Relay>) {
        let Ok(config) = RelayConfig::from_lookup(|_| None) else {
            panic!("default configuration must load");
        };
        let relay = Arc::new(Relay::new(
            config.relay.clone(),
            Arc::new(MemoryRecorder::new()),
        ));
        (
            build_app(AppState::new(Arc::clone(&relay), &config)),
            relay,
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let Ok(request) = Request::builder().uri(uri).body(Body::empty()) else {
            panic!("valid request");
        };
        let Ok(response) = app.oneshot(request).await;
        let status = response.status();
        let Ok(bytes) = axum::body::to_bytes(response.into_body(), usize::MAX).await else {
            panic!("readable body");
        };
        let Ok(body) = serde_json::from_slice(&bytes) else {
            panic!("JSON body from {uri}");
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_is_ok_while_accepting() {
        let (app, _relay) = app();
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.get("status").and_then(Value::as_str), Some("healthy"));
        assert_eq!(body.get("connections").and_then(Value::as_u64), Some(0));
    }

    #[tokio::test]
    async fn health_is_unavailable_while_draining() {
        let (app, relay) = app();
        assert_eq!(relay.shutdown().await, 0);
        let (status, body) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.get("status").and_then(Value::as_str), Some("draining"));
    }

    #[tokio::test]
    async fn destination_detail_uses_percent_encoded_name() {
        let (app, relay) = app();
        let (outbox, _rx) = Outbox::channel(8);
        let id = relay.handle_connect(outbox).await;
        assert!(relay.handle_frame(id, b"CONNECT\n\n").await.is_ok());
        assert!(
            relay
                .handle_frame(id, b"SUBSCRIBE\ndestination:/topic/messages\n\n")
                .await
                .is_ok()
        );

        let (status, list) = get_json(app.clone(), "/api/v1/destinations").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.get("total").and_then(Value::as_u64), Some(1));

        let (status, detail) =
            get_json(app, "/api/v1/destinations/%2Ftopic%2Fmessages").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            detail.get("name").and_then(Value::as_str),
            Some("/topic/messages")
        );
    }

    #[tokio::test]
    async fn unknown_destination_is_not_found() {
        let (app, _relay) = app();
        let (status, body) = get_json(app, "/api/v1/destinations/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body.get("error")
                .and_then(|e| e.get("code"))
                .and_then(Value::as_u64),
            Some(2001)
        );
    }

    #[test]
    fn openapi_lists_rest_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/health"));
        assert!(doc.paths.paths.contains_key("/api/v1/destinations/{name}"));
    }
}
