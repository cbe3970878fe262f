//! Feed Gateway Binary
//!
//! Starts the market data feed gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-gateway
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTREAM_WS_URL`: Base WebSocket URL of the upstream market data feed
//!
//! ## Optional
//! - `UPSTREAM_AUTH_TOKEN`: Token for the upstream auth handshake
//! - `INGEST_QUEUE_CAPACITY`: Per-client ingest queue capacity (default: 1024)
//! - `RECONNECT_DELAY_SECS`: Fixed delay before reconnect attempts (default: 5)
//! - `DRAIN_JOIN_TIMEOUT_SECS`: Drain wait on stop paths (default: 2)
//! - `CAPTURE_DIR`: Directory for per-client capture databases (default: ./captures)
//! - `CAPTURE_TABLE`: Capture table name (default: capture)
//! - `CAPTURE_LIMIT`: Most-recent rows kept per store, 0 = all (default: 0)
//! - `BROADCAST_HOST`: Default broadcast bind host (default: 127.0.0.1)
//! - `BROADCAST_PORT`: Default broadcast bind port (default: 8765)
//! - `HEALTH_ADDR`: Health server bind address (default: 0.0.0.0:9090)
//! - `BOOTSTRAP_NAME`: When set, create this client at startup (with
//!   `BOOTSTRAP_AUTH_TOKEN`, `BOOTSTRAP_SYMBOLS`, `BOOTSTRAP_PROVIDER`,
//!   `BOOTSTRAP_ASSET_TYPE`, `BOOTSTRAP_FEED`, `BOOTSTRAP_START_BROADCAST`,
//!   `BOOTSTRAP_SAVE_RESULTS`, `BOOTSTRAP_RESULTS_FILE`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint; enables trace export
//! - `OTEL_SERVICE_NAME`: Service name (default: feed-gateway)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use feed_gateway::infrastructure::health::{HealthServer, HealthServerState};
use feed_gateway::infrastructure::telemetry;
use feed_gateway::{
    ConnectionGateway, ConnectionRequest, GatewayConfig, WsProviderFactory, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Feed Gateway");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Provider factory for upstream WebSocket sessions
    let factory = Arc::new(WsProviderFactory::new(
        config.upstream.ws_url.clone(),
        config.upstream.credentials.clone(),
    ));

    // Client registry and control surface
    let gateway = Arc::new(ConnectionGateway::new(factory, config.to_client_settings()));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&gateway),
    ));
    let health_server = HealthServer::new(
        config.health.addr,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Optional bootstrap client from BOOTSTRAP_* variables
    if let Some(bootstrap) = config.bootstrap.clone() {
        let request = ConnectionRequest {
            name: bootstrap.name.clone(),
            provider: bootstrap.provider,
            asset_type: bootstrap.asset_type,
            feed: bootstrap.feed,
            symbols: bootstrap.symbols,
            start_broadcast: bootstrap.start_broadcast,
            broadcast_host: None,
            broadcast_port: None,
            save_results: bootstrap.save_results,
            results_file: bootstrap.results_file,
            auth_token: bootstrap.auth_token,
        };

        match gateway.create_connection(request).await {
            Ok(status) => {
                tracing::info!(
                    client = %status.name,
                    broadcasting = status.is_broadcasting,
                    "Bootstrap client connected"
                );
            }
            Err(e) => {
                tracing::error!(client = %bootstrap.name, error = %e, "Bootstrap client failed");
            }
        }
    }

    tracing::info!("Feed gateway ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, gateway.kill_all())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out before all clients stopped");
    }

    tracing::info!("Feed gateway stopped");
    Ok(())
}

/// Load .env from the current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        upstream_url = %config.upstream.ws_url,
        authenticated = config.upstream.credentials.is_some(),
        queue_capacity = config.ingest.queue_capacity,
        reconnect_delay_secs = config.lifecycle.reconnect_delay.as_secs(),
        capture_dir = %config.capture.dir.display(),
        broadcast_host = %config.broadcast.host,
        broadcast_port = config.broadcast.port,
        health_addr = %config.health.addr,
        bootstrap = config.bootstrap.is_some(),
        "Configuration loaded"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
