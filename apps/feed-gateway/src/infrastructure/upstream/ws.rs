//! WebSocket Feed Adapter
//!
//! Concrete [`UpstreamProvider`] that dials a feed over WebSocket
//! (TLS via rustls) and speaks a small JSON control protocol:
//!
//! ```json
//! {"action": "auth", "token": "<token>"}
//! {"action": "subscribe", "symbols": ["AAPL", "MSFT"]}
//! {"action": "unsubscribe", "symbols": ["AAPL"]}
//! ```
//!
//! Authentication, when credentials are configured, completes inside
//! `connect`: the auth frame is sent and the session is not handed to
//! the connector until the feed acknowledges with
//! `{"status": "ok"}`. A rejection or timeout surfaces as
//! [`ProviderError::AuthRejected`], which the connector never retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::provider::{
    ProviderError, ProviderFactory, ProviderRequest, ProviderSession, SessionSink, SessionStream,
    UpstreamProvider,
};
use crate::infrastructure::config::FeedCredentials;

/// How long to wait for the feed to acknowledge authentication.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Wire Messages
// =============================================================================

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    action: &'static str,
    token: &'a str,
}

impl<'a> AuthRequest<'a> {
    fn new(token: &'a str) -> Self {
        Self {
            action: "auth",
            token,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthAck {
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct SymbolRequest<'a> {
    action: &'static str,
    symbols: &'a [String],
}

// =============================================================================
// WebSocket Provider
// =============================================================================

/// Configuration for a single feed endpoint.
#[derive(Debug, Clone)]
pub struct WsProviderConfig {
    /// Full WebSocket URL to dial.
    pub url: String,
    /// Credentials for the auth handshake; `None` skips it.
    pub credentials: Option<FeedCredentials>,
    /// Auth acknowledgment deadline.
    pub auth_timeout: Duration,
}

/// [`UpstreamProvider`] over a WebSocket feed.
#[derive(Debug)]
pub struct WsFeedProvider {
    id: String,
    config: WsProviderConfig,
}

impl WsFeedProvider {
    /// Create a provider for the given endpoint.
    #[must_use]
    pub fn new(id: impl Into<String>, config: WsProviderConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }
}

#[async_trait]
impl UpstreamProvider for WsFeedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<ProviderSession, ProviderError> {
        tracing::info!(provider = %self.id, url = %self.config.url, "Connecting to upstream feed");

        let (ws_stream, _response) = connect_async(&self.config.url)
            .await
            .map_err(|e| ProviderError::ConnectFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        if let Some(credentials) = &self.config.credentials {
            send_json(&mut write, &AuthRequest::new(credentials.token())).await?;
            await_auth_ack(&mut read, self.config.auth_timeout).await?;
            tracing::info!(provider = %self.id, "Upstream feed authenticated");
        }

        Ok(ProviderSession {
            sink: Box::new(WsFeedSink { write }),
            stream: Box::new(WsFeedStream { read }),
        })
    }
}

/// Read frames until the feed acknowledges or rejects authentication.
async fn await_auth_ack(
    read: &mut SplitStream<WsStream>,
    deadline: Duration,
) -> Result<(), ProviderError> {
    let handshake = async {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    // Banners and other chatter may precede the ack
                    let Ok(ack) = serde_json::from_str::<AuthAck>(&text) else {
                        continue;
                    };
                    return match ack.status.as_str() {
                        "ok" | "authenticated" | "success" => Ok(()),
                        _ => Err(ProviderError::AuthRejected(if ack.message.is_empty() {
                            ack.status
                        } else {
                            ack.message
                        })),
                    };
                }
                Ok(Message::Close(_)) => {
                    return Err(ProviderError::AuthRejected(
                        "connection closed during authentication".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(ProviderError::Transport(e.to_string())),
            }
        }
        Err(ProviderError::AuthRejected(
            "connection closed during authentication".to_string(),
        ))
    };

    match tokio::time::timeout(deadline, handshake).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::AuthRejected(
            "authentication timed out".to_string(),
        )),
    }
}

async fn send_json<T: Serialize>(
    write: &mut SplitSink<WsStream, Message>,
    value: &T,
) -> Result<(), ProviderError> {
    let json = serde_json::to_string(value).map_err(|e| ProviderError::InvalidMessage(e.to_string()))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))
}

// =============================================================================
// Session Halves
// =============================================================================

struct WsFeedSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SessionSink for WsFeedSink {
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError> {
        send_json(
            &mut self.write,
            &SymbolRequest {
                action: "subscribe",
                symbols,
            },
        )
        .await
    }

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError> {
        send_json(
            &mut self.write,
            &SymbolRequest {
                action: "unsubscribe",
                symbols,
            },
        )
        .await
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        self.write
            .close()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

struct WsFeedStream {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SessionStream for WsFeedStream {
    async fn recv(&mut self) -> Result<Option<String>, ProviderError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(_))) => {
                    // Feeds speak JSON text; binary frames are noise
                    tracing::trace!("Ignoring binary frame from upstream");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(ProviderError::Transport(e.to_string())),
            }
        }
    }
}

// =============================================================================
// Factory
// =============================================================================

/// [`ProviderFactory`] that derives feed URLs from one configured base.
///
/// The request's asset type and feed name become path segments under
/// the base URL, e.g. `wss://feed.example.com/v1` + `stocks`/`sip`
/// dials `wss://feed.example.com/v1/stocks/sip`.
#[derive(Debug, Clone)]
pub struct WsProviderFactory {
    base_url: String,
    credentials: Option<FeedCredentials>,
    auth_timeout: Duration,
}

impl WsProviderFactory {
    /// Create a factory dialing endpoints under `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, credentials: Option<FeedCredentials>) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            auth_timeout: AUTH_TIMEOUT,
        }
    }

    fn feed_url(&self, request: &ProviderRequest) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_string();
        if let Some(asset_type) = &request.asset_type {
            url.push('/');
            url.push_str(asset_type);
        }
        if let Some(feed) = &request.feed {
            url.push('/');
            url.push_str(feed);
        }
        url
    }
}

impl ProviderFactory for WsProviderFactory {
    fn create(&self, request: &ProviderRequest) -> Result<Arc<dyn UpstreamProvider>, ProviderError> {
        if request.provider.trim().is_empty() {
            return Err(ProviderError::UnknownProvider(request.provider.clone()));
        }

        let config = WsProviderConfig {
            url: self.feed_url(request),
            credentials: self.credentials.clone(),
            auth_timeout: self.auth_timeout,
        };
        Ok(Arc::new(WsFeedProvider::new(request.provider.clone(), config)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn auth_request_serializes() {
        let json = serde_json::to_string(&AuthRequest::new("secret-token")).unwrap();
        assert_eq!(json, r#"{"action":"auth","token":"secret-token"}"#);
    }

    #[test]
    fn symbol_request_serializes() {
        let symbols = vec!["AAPL".to_string(), "MSFT".to_string()];
        let json = serde_json::to_string(&SymbolRequest {
            action: "subscribe",
            symbols: &symbols,
        })
        .unwrap();
        assert_eq!(json, r#"{"action":"subscribe","symbols":["AAPL","MSFT"]}"#);
    }

    #[test]
    fn auth_ack_parses_success_and_rejection() {
        let ack: AuthAck = serde_json::from_str(r#"{"status": "ok"}"#).unwrap();
        assert_eq!(ack.status, "ok");
        assert!(ack.message.is_empty());

        let ack: AuthAck =
            serde_json::from_str(r#"{"status": "error", "message": "bad token"}"#).unwrap();
        assert_eq!(ack.status, "error");
        assert_eq!(ack.message, "bad token");
    }

    #[test_case(None, None, "wss://feed.example.com/v1"; "base only")]
    #[test_case(Some("stocks"), None, "wss://feed.example.com/v1/stocks"; "asset type")]
    #[test_case(Some("stocks"), Some("sip"), "wss://feed.example.com/v1/stocks/sip"; "asset and feed")]
    fn factory_builds_feed_url(asset_type: Option<&str>, feed: Option<&str>, expected: &str) {
        let factory = WsProviderFactory::new("wss://feed.example.com/v1/", None);
        let request = ProviderRequest {
            provider: "polygon".to_string(),
            asset_type: asset_type.map(ToString::to_string),
            feed: feed.map(ToString::to_string),
        };

        assert_eq!(factory.feed_url(&request), expected);
    }

    #[test]
    fn factory_rejects_blank_provider() {
        let factory = WsProviderFactory::new("wss://feed.example.com", None);
        let err = factory
            .create(&ProviderRequest {
                provider: "  ".to_string(),
                ..ProviderRequest::default()
            })
            .unwrap_err();

        assert!(matches!(err, ProviderError::UnknownProvider(_)));
    }
}
