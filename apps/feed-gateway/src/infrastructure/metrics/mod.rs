//! Prometheus Metrics Module
//!
//! Exposes gateway metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingest**: frames received from upstream and drops on queue overflow
//! - **Broadcast**: frames delivered to downstream subscribers
//! - **Capture**: rows written to the durable capture log
//! - **Lifecycle**: upstream reconnect attempts, active clients
//!
//! Counters carry a `client` label so several named connections can be
//! told apart. Metrics are exposed at `/metrics` on the health server.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            #[allow(clippy::expect_used)]
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "gateway_ingest_messages_total",
        "Total frames received from upstream feeds"
    );
    describe_counter!(
        "gateway_ingest_dropped_total",
        "Total frames dropped on ingest queue overflow"
    );
    describe_counter!(
        "gateway_broadcast_frames_total",
        "Total frames delivered to downstream subscribers"
    );
    describe_counter!(
        "gateway_capture_writes_total",
        "Total rows written to the capture store"
    );
    describe_counter!(
        "gateway_upstream_reconnects_total",
        "Total upstream reconnection attempts"
    );

    describe_gauge!("gateway_clients_active", "Number of registered clients");
    describe_gauge!(
        "gateway_subscribers_active",
        "Number of connected downstream subscribers"
    );
    describe_gauge!(
        "gateway_symbols_active",
        "Number of symbols with at least one subscriber"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one frame received from an upstream feed.
pub fn record_ingest_message(client: &str) {
    counter!(
        "gateway_ingest_messages_total",
        "client" => client.to_string()
    )
    .increment(1);
}

/// Record one frame dropped on ingest queue overflow.
pub fn record_ingest_dropped(client: &str) {
    counter!(
        "gateway_ingest_dropped_total",
        "client" => client.to_string()
    )
    .increment(1);
}

/// Record frames delivered to downstream subscribers.
pub fn record_broadcast_frames(client: &str, count: u64) {
    counter!(
        "gateway_broadcast_frames_total",
        "client" => client.to_string()
    )
    .increment(count);
}

/// Record one row written to the capture store.
pub fn record_capture_write(client: &str) {
    counter!(
        "gateway_capture_writes_total",
        "client" => client.to_string()
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(client: &str) {
    counter!(
        "gateway_upstream_reconnects_total",
        "client" => client.to_string()
    )
    .increment(1);
}

/// Update the registered client count.
pub fn set_clients_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_clients_active").set(count as f64);
}

/// Update the connected subscriber count.
pub fn set_subscribers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_subscribers_active").set(count as f64);
}

/// Update the watched symbol count.
pub fn set_symbols_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("gateway_symbols_active").set(count as f64);
}
