//! Upstream Provider Ports
//!
//! Trait seams between the connection lifecycle and the concrete feed
//! transport. The connector drives these ports; the WebSocket adapter
//! in [`super::ws`] implements them for real feeds, and tests swap in
//! scripted fakes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by feed providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The feed refused our credentials. Fatal: never retried.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The transport could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The transport failed mid-session.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded for sending.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No provider registered under the requested name.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Whether this error is an authentication rejection, which the
    /// connector treats as fatal rather than retryable.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

// =============================================================================
// Session Ports
// =============================================================================

/// Write half of an established feed session.
#[async_trait]
pub trait SessionSink: Send {
    /// Send a batched subscribe request for the given symbols.
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError>;

    /// Send a batched unsubscribe request for the given symbols.
    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError>;

    /// Close the session cleanly.
    async fn close(&mut self) -> Result<(), ProviderError>;
}

/// Read half of an established feed session.
#[async_trait]
pub trait SessionStream: Send {
    /// Receive the next text payload.
    ///
    /// `Ok(None)` means the feed closed the stream; an error means the
    /// transport failed. Either way the session is over.
    async fn recv(&mut self) -> Result<Option<String>, ProviderError>;
}

/// An established feed session, already authenticated.
pub struct ProviderSession {
    /// Write half, used for subscribe/unsubscribe/close.
    pub sink: Box<dyn SessionSink>,
    /// Read half, drained by the receive loop.
    pub stream: Box<dyn SessionStream>,
}

impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession").finish_non_exhaustive()
    }
}

// =============================================================================
// Provider Ports
// =============================================================================

/// A feed backend the connector can dial.
///
/// Authentication happens inside [`UpstreamProvider::connect`]: a
/// returned session is ready for subscriptions, and a rejected
/// credential surfaces as [`ProviderError::AuthRejected`].
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    /// Stable identifier for logging.
    fn id(&self) -> &str;

    /// Dial the feed and complete the authentication handshake.
    async fn connect(&self) -> Result<ProviderSession, ProviderError>;
}

impl std::fmt::Debug for dyn UpstreamProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamProvider")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// What a client asked to be connected to.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    /// Provider name (e.g. "polygon").
    pub provider: String,
    /// Asset class within the provider (e.g. "stocks", "crypto").
    pub asset_type: Option<String>,
    /// Named feed within the asset class (e.g. "sip", "delayed").
    pub feed: Option<String>,
}

/// Builds providers from connection requests.
///
/// The gateway owns one factory; swapping it out is the seam tests use
/// to avoid real sockets.
pub trait ProviderFactory: Send + Sync {
    /// Resolve a request into a dialable provider.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnknownProvider`] when the request
    /// names no usable provider.
    fn create(&self, request: &ProviderRequest) -> Result<Arc<dyn UpstreamProvider>, ProviderError>;
}
