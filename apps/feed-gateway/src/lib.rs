#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feed Gateway - Market Data Streaming Gateway
//!
//! A control-plane gateway that maintains named upstream WebSocket feed
//! connections, fans decoded ticks out to downstream WebSocket
//! subscribers, and durably captures traffic for later replay.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core streaming logic and data types
//!   - `stream`: Tick frame model and payload decoding
//!   - `subscription`: Symbol routing and reference counting
//!
//! - **Application**: Client aggregate and control surface
//!   - `client`: Per-connection aggregate behind the `StreamingClient` trait
//!   - `gateway`: Named client registry and authenticated operations
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: WebSocket feed provider and connection lifecycle
//!   - `ingest`: Bounded queue between receive loop and broadcaster
//!   - `broadcast`: Fan-out hub and downstream WebSocket server
//!   - `capture`: Durable SQLite-backed message log
//!   - `config`: Environment-driven configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Upstream WS ──► Receive ──► Ingest ──► Broadcaster ──┬──► Subscriber 1
//!                 Thread      Queue          │         ├──► Subscriber 2
//!                                            ▼         └──► Subscriber N
//!                                       CaptureStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Client aggregate and gateway control surface.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::stream::{FrameError, Symbol, TickFrame};
pub use domain::subscription::{
    RouterStats, SubscriberId, SubscriptionChanges, SubscriptionRouter,
};

// Application surface
pub use application::client::{
    AuthToken, ClientError, ClientSettings, ClientStatus, FeedClient, StreamingClient,
};
pub use application::gateway::{
    ConnectionGateway, ConnectionRequest, GatewayError, KillConfirmation,
};

// Infrastructure config
pub use infrastructure::config::{
    BootstrapSettings, BroadcastSettings, CaptureSettings, ConfigError, FeedCredentials,
    GatewayConfig, HealthSettings, IngestSettings, LifecycleSettings, UpstreamSettings,
};

// Capture store (for integration tests)
pub use infrastructure::capture::{CaptureError, CaptureRecord, CaptureStore};

// Ingest bridge (for integration tests)
pub use infrastructure::ingest::{IngestBridge, QueueMessage};

// Upstream connector and provider ports
pub use infrastructure::upstream::{
    ConnectionState, ConnectorError, LinkState, ProviderError, ProviderFactory, ProviderRequest,
    ProviderSession, SessionSink, SessionStream, UpstreamConnector, UpstreamProvider,
    WsFeedProvider, WsProviderFactory,
};

// Broadcast hub and downstream server (for integration tests)
pub use infrastructure::broadcast::{
    BroadcastError, BroadcastServer, BroadcastServerHandle, Broadcaster, SubscriberHub,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
