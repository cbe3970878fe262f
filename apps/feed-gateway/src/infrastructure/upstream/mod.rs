//! Upstream Feed Integration
//!
//! Everything between the gateway and the market-data feed: the
//! provider ports, the WebSocket adapter that implements them, and the
//! connector state machine that owns a session's lifecycle.

pub mod connector;
pub mod provider;
pub mod ws;

pub use connector::{ConnectionState, ConnectorError, LinkState, UpstreamConnector};
pub use provider::{
    ProviderError, ProviderFactory, ProviderRequest, ProviderSession, SessionSink, SessionStream,
    UpstreamProvider,
};
pub use ws::{WsFeedProvider, WsProviderConfig, WsProviderFactory};
