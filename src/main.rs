//! ws-stomp-relay server entry point.
//!
//! Starts the Axum HTTP server with the WebSocket relay and REST endpoints,
//! and drains the relay on SIGINT / SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use ws_stomp_relay::api;
use ws_stomp_relay::app_state::AppState;
use ws_stomp_relay::config::{LogFormat, RelayConfig};
use ws_stomp_relay::service::Relay;
use ws_stomp_relay::telemetry::{Recorder, TracingRecorder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = RelayConfig::from_env().context("invalid configuration")?;

    // Initialize tracing
    init_tracing(config.log_format);
    tracing::info!(
        addr = %config.listen_addr,
        service = %config.service_name,
        environment = %config.environment,
        routes = config.relay.routes.len(),
        "starting ws-stomp-relay"
    );

    // Build the relay
    let recorder: Arc<dyn Recorder> = Arc::new(TracingRecorder::new(
        config.service_name.as_str(),
        config.environment.as_str(),
    ));
    let relay = Arc::new(Relay::new(config.relay.clone(), recorder));

    // Build router
    let app = api::build_app(AppState::new(Arc::clone(&relay), &config));

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&relay)))
        .await
        .context("server error")?;

    wait_for_sessions(&relay, config.relay.shutdown_grace).await;
    tracing::info!("ws-stomp-relay stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Resolves on SIGINT or SIGTERM after the relay has drained and asked every
/// session to close.
async fn shutdown_signal(relay: Arc<Relay>) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
    relay.shutdown().await;
}

/// Gives closing sessions up to `grace` to run their disconnect cleanup.
async fn wait_for_sessions(relay: &Relay, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while relay.connection_count().await > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let remaining = relay.connection_count().await;
    if remaining > 0 {
        tracing::warn!(sessions = remaining, "exiting with sessions still open");
    }
}
