//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream WebSocket feed adapters and connection lifecycle.
pub mod upstream;

/// Bounded ingest queue between the receive loop and the broadcaster.
pub mod ingest;

/// Fan-out hub and downstream WebSocket server.
pub mod broadcast;

/// Durable SQLite-backed capture log.
pub mod capture;

/// Configuration loading from the environment.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
