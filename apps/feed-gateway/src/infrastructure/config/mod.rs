//! Configuration Module
//!
//! Configuration loading for the feed gateway.

mod settings;

pub use settings::{
    BootstrapSettings, BroadcastSettings, CaptureSettings, ConfigError, FeedCredentials,
    GatewayConfig, HealthSettings, IngestSettings, LifecycleSettings, UpstreamSettings,
};
