//! Gateway Configuration Settings
//!
//! Configuration types for the feed gateway, loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::application::client::ClientSettings;

/// Upstream feed credentials.
///
/// Holds the bearer token sent in the authentication handshake. The
/// token never appears in `Debug` output or log events.
#[derive(Clone)]
pub struct FeedCredentials {
    token: String,
}

impl FeedCredentials {
    /// Create credentials from a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Get the raw token for the auth handshake.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Upstream WebSocket endpoint settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Base WebSocket URL for the market data feed.
    pub ws_url: String,
    /// Optional credentials for the auth handshake.
    pub credentials: Option<FeedCredentials>,
}

/// Ingest queue settings.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Capacity of the per-client ingest queue, in frames.
    pub queue_capacity: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Connection lifecycle timing settings.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Fixed delay slept before every reconnect attempt.
    pub reconnect_delay: Duration,
    /// How long stop paths wait for the drain task and receive thread.
    pub drain_join_timeout: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            drain_join_timeout: Duration::from_secs(2),
        }
    }
}

/// Capture store settings.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Directory holding per-client capture databases
    /// (`<dir>/<client>.db`).
    pub dir: PathBuf,
    /// Table name inside each capture database.
    pub table: String,
    /// Most-recent rows kept per store; zero keeps everything.
    pub limit: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./captures"),
            table: "capture".to_string(),
            limit: 0,
        }
    }
}

/// Downstream broadcast server settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Default bind host for per-client broadcast servers.
    pub host: String,
    /// Default bind port for per-client broadcast servers.
    pub port: u16,
    /// Per-subscriber outbound buffer, in frames.
    pub subscriber_buffer: usize,
    /// Keepalive ping cadence for downstream sockets.
    pub ping_interval: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            subscriber_buffer: 256,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Health server settings.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    /// Bind address for the health and metrics HTTP server.
    pub addr: SocketAddr,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Client created automatically at startup.
#[derive(Clone)]
pub struct BootstrapSettings {
    /// Registry name for the bootstrap client.
    pub name: String,
    /// Symbols subscribed immediately.
    pub symbols: Vec<String>,
    /// Provider id resolved through the factory.
    pub provider: String,
    /// Optional asset-type path segment.
    pub asset_type: Option<String>,
    /// Optional feed path segment.
    pub feed: Option<String>,
    /// Stand up the broadcast server right after connecting.
    pub start_broadcast: bool,
    /// Token for later operations on the bootstrap client.
    pub auth_token: String,
    /// Persist received frames to a capture store.
    pub save_results: bool,
    /// Export the capture store here when the client is killed.
    pub results_file: Option<PathBuf>,
}

impl std::fmt::Debug for BootstrapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSettings")
            .field("name", &self.name)
            .field("symbols", &self.symbols)
            .field("provider", &self.provider)
            .field("asset_type", &self.asset_type)
            .field("feed", &self.feed)
            .field("start_broadcast", &self.start_broadcast)
            .field("auth_token", &"[REDACTED]")
            .field("save_results", &self.save_results)
            .field("results_file", &self.results_file)
            .finish()
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upstream endpoint settings.
    pub upstream: UpstreamSettings,
    /// Ingest queue settings.
    pub ingest: IngestSettings,
    /// Lifecycle timing settings.
    pub lifecycle: LifecycleSettings,
    /// Capture store settings.
    pub capture: CaptureSettings,
    /// Broadcast server settings.
    pub broadcast: BroadcastSettings,
    /// Health server settings.
    pub health: HealthSettings,
    /// Optional client created at startup.
    pub bootstrap: Option<BootstrapSettings>,
}

impl GatewayConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset or unparseable optional variables fall back to their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `UPSTREAM_WS_URL` is missing or empty, or
    /// if bootstrap variables are present but incomplete.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_url = std::env::var("UPSTREAM_WS_URL")
            .map_err(|_| ConfigError::MissingEnvVar("UPSTREAM_WS_URL".to_string()))?;

        if ws_url.is_empty() {
            return Err(ConfigError::EmptyValue("UPSTREAM_WS_URL".to_string()));
        }

        let credentials = std::env::var("UPSTREAM_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .map(FeedCredentials::new);

        let ingest = IngestSettings {
            queue_capacity: parse_env_usize(
                "INGEST_QUEUE_CAPACITY",
                IngestSettings::default().queue_capacity,
            ),
        };

        let lifecycle = LifecycleSettings {
            reconnect_delay: parse_env_duration_secs(
                "RECONNECT_DELAY_SECS",
                LifecycleSettings::default().reconnect_delay,
            ),
            drain_join_timeout: parse_env_duration_secs(
                "DRAIN_JOIN_TIMEOUT_SECS",
                LifecycleSettings::default().drain_join_timeout,
            ),
        };

        let capture_defaults = CaptureSettings::default();
        let capture = CaptureSettings {
            dir: std::env::var("CAPTURE_DIR").map_or(capture_defaults.dir, PathBuf::from),
            table: std::env::var("CAPTURE_TABLE").unwrap_or(capture_defaults.table),
            limit: parse_env_u64("CAPTURE_LIMIT", capture_defaults.limit),
        };

        let broadcast_defaults = BroadcastSettings::default();
        let broadcast = BroadcastSettings {
            host: std::env::var("BROADCAST_HOST").unwrap_or(broadcast_defaults.host),
            port: parse_env_u16("BROADCAST_PORT", broadcast_defaults.port),
            subscriber_buffer: broadcast_defaults.subscriber_buffer,
            ping_interval: broadcast_defaults.ping_interval,
        };

        let health = HealthSettings {
            addr: parse_env_socket_addr("HEALTH_ADDR", HealthSettings::default().addr),
        };

        Ok(Self {
            upstream: UpstreamSettings {
                ws_url,
                credentials,
            },
            ingest,
            lifecycle,
            capture,
            broadcast,
            health,
            bootstrap: bootstrap_from_env()?,
        })
    }

    /// Per-client settings derived from this configuration.
    #[must_use]
    pub fn to_client_settings(&self) -> ClientSettings {
        ClientSettings {
            queue_capacity: self.ingest.queue_capacity,
            reconnect_delay: self.lifecycle.reconnect_delay,
            drain_timeout: self.lifecycle.drain_join_timeout,
            capture_dir: self.capture.dir.clone(),
            capture_table: self.capture.table.clone(),
            capture_limit: self.capture.limit,
            broadcast_host: self.broadcast.host.clone(),
            broadcast_port: self.broadcast.port,
            subscriber_buffer: self.broadcast.subscriber_buffer,
            ping_interval: self.broadcast.ping_interval,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn bootstrap_from_env() -> Result<Option<BootstrapSettings>, ConfigError> {
    let Some(name) = std::env::var("BOOTSTRAP_NAME")
        .ok()
        .filter(|name| !name.is_empty())
    else {
        return Ok(None);
    };

    let auth_token = std::env::var("BOOTSTRAP_AUTH_TOKEN")
        .map_err(|_| ConfigError::MissingEnvVar("BOOTSTRAP_AUTH_TOKEN".to_string()))?;

    if auth_token.is_empty() {
        return Err(ConfigError::EmptyValue("BOOTSTRAP_AUTH_TOKEN".to_string()));
    }

    let symbols = std::env::var("BOOTSTRAP_SYMBOLS")
        .map(|raw| split_symbols(&raw))
        .unwrap_or_default();

    Ok(Some(BootstrapSettings {
        name,
        symbols,
        provider: std::env::var("BOOTSTRAP_PROVIDER").unwrap_or_else(|_| "websocket".to_string()),
        asset_type: std::env::var("BOOTSTRAP_ASSET_TYPE")
            .ok()
            .filter(|v| !v.is_empty()),
        feed: std::env::var("BOOTSTRAP_FEED").ok().filter(|v| !v.is_empty()),
        start_broadcast: parse_env_bool("BOOTSTRAP_START_BROADCAST", true),
        auth_token,
        save_results: parse_env_bool("BOOTSTRAP_SAVE_RESULTS", false),
        results_file: std::env::var("BOOTSTRAP_RESULTS_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
    }))
}

fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key).ok().map_or(default, |v| {
        matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_socket_addr(key: &str, default: SocketAddr) -> SocketAddr {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
