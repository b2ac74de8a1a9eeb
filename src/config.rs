//! Relay configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Unlike a silent fallback, a variable
//! that is set but unparseable is a [`ConfigError`] and stops start-up.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::DestinationRoutes;
use crate::error::ConfigError;

/// Log output format for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Behaviour knobs consumed by [`crate::service::Relay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Upper bound on one subscriber write during fan-out.
    pub write_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Deliver a SEND back to its own sender when it is subscribed.
    pub echo_to_sender: bool,
    /// Upper bound on waiting for in-flight fan-outs during shutdown.
    pub shutdown_grace: Duration,
    /// Application destination → broker destination routes.
    pub routes: DestinationRoutes,
    /// Value of the `server` header on CONNECTED frames.
    pub server_name: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            echo_to_sender: false,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            routes: DestinationRoutes::new(),
            server_name: format!("{DEFAULT_SERVICE_NAME}/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Top-level process configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:8080`).
    pub listen_addr: SocketAddr,

    /// Telemetry `service.name` resource attribute.
    pub service_name: String,

    /// Telemetry `deployment.environment` resource attribute.
    pub environment: String,

    /// Close a connection that sends nothing for this long. `None` disables
    /// the check.
    pub idle_timeout: Option<Duration>,

    /// Log output format.
    pub log_format: LogFormat,

    /// Settings handed to the relay.
    pub relay: RelaySettings,
}

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SERVICE_NAME: &str = "ws-stomp";
const DEFAULT_ENVIRONMENT: &str = "ws-stomp";
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_OUTBOUND_BUFFER: usize = 256;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
const DEFAULT_ROUTES: &str = "/app/tube=/topic/messages";

impl RelayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any variable is set to a value that
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any present value cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = raw_addr
            .parse()
            .map_err(|source| ConfigError::InvalidListenAddr {
                value: raw_addr.clone(),
                source,
            })?;

        let service_name =
            lookup("OTEL_SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());
        let environment =
            lookup("DEPLOYMENT_ENVIRONMENT").unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

        let write_timeout_ms = parse_var(&lookup, "RELAY_WRITE_TIMEOUT_MS", DEFAULT_WRITE_TIMEOUT_MS)?;
        let outbound_buffer = parse_var(&lookup, "RELAY_OUTBOUND_BUFFER", DEFAULT_OUTBOUND_BUFFER)?;
        let idle_timeout_secs =
            parse_var(&lookup, "RELAY_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?;
        let shutdown_grace_secs =
            parse_var(&lookup, "RELAY_SHUTDOWN_GRACE_SECS", DEFAULT_SHUTDOWN_GRACE_SECS)?;
        let echo_to_sender = parse_bool(&lookup, "RELAY_ECHO_TO_SENDER", false)?;
        let routes = lookup("RELAY_ROUTES")
            .as_deref()
            .unwrap_or(DEFAULT_ROUTES)
            .parse::<DestinationRoutes>()?;
        let log_format = parse_var(&lookup, "LOG_FORMAT", LogFormat::Text)?;

        if write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_WRITE_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }
        if outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_OUTBOUND_BUFFER",
                value: "0".to_string(),
            });
        }

        let server_name = format!("{service_name}/{}", env!("CARGO_PKG_VERSION"));

        Ok(Self {
            listen_addr,
            service_name,
            environment,
            idle_timeout: (idle_timeout_secs > 0).then(|| Duration::from_secs(idle_timeout_secs)),
            log_format,
            relay: RelaySettings {
                write_timeout: Duration::from_millis(write_timeout_ms),
                outbound_buffer,
                echo_to_sender,
                shutdown_grace: Duration::from_secs(shutdown_grace_secs),
                routes,
                server_name,
            },
        })
    }
}

/// Parses a variable as `T`, returning `default` when it is not set.
fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

/// Parses a variable as a boolean. Accepts `"true"`, `"1"`, `"false"`,
/// `"0"` (case-insensitive).
fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
    }
}
