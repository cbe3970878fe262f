//! Domain Layer - Core streaming types and business logic.
//!
//! This layer contains the core domain types for market data routing
//! with no external dependencies. All types here are pure Rust with
//! serialization support.

/// Tick frame model and payload decoding.
pub mod stream;

/// Symbol routing and subscriber reference counting.
pub mod subscription;
