//! Downstream WebSocket Server
//!
//! Accepts subscriber sockets on `/stream` and keeps the router and
//! hub in sync with each socket's declared interest.
//!
//! # Protocol
//!
//! A subscriber declares interest by sending
//!
//! ```json
//! {"params": {"symbol": ["AAPL", "MSFT"]}}
//! ```
//!
//! The submitted list replaces the socket's previous interest; an
//! empty list clears it. The server pushes tick frames
//! (`{"date", "symbol", "price", ...}`) only for symbols the socket
//! currently watches. Interest changes that flip a symbol's first or
//! last watcher are forwarded upstream as batched subscribe and
//! unsubscribe calls.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BroadcastError, SubscriberHub};
use crate::domain::subscription::{SubscriberId, SubscriptionChanges, SubscriptionRouter};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::UpstreamConnector;

/// How long `shutdown` waits for the serve task before aborting it.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Wire Messages
// =============================================================================

#[derive(Debug, Deserialize)]
struct InterestMessage {
    params: InterestParams,
}

#[derive(Debug, Deserialize)]
struct InterestParams {
    #[serde(default)]
    symbol: Vec<String>,
}

// =============================================================================
// Server
// =============================================================================

/// Listen address and tuning for one client's broadcast server.
#[derive(Debug, Clone)]
pub struct BroadcastServerConfig {
    /// Client the server belongs to, for logs and metrics.
    pub client: String,
    /// Host to bind.
    pub host: String,
    /// Port to bind. Zero picks an ephemeral port.
    pub port: u16,
    /// Per-subscriber outbound buffer, in frames.
    pub subscriber_buffer: usize,
    /// Keepalive ping cadence.
    pub ping_interval: Duration,
}

struct ServerState {
    client: String,
    router: Arc<SubscriptionRouter>,
    hub: Arc<SubscriberHub>,
    connector: Arc<UpstreamConnector>,
    subscriber_buffer: usize,
    ping_interval: Duration,
    cancel: CancellationToken,
}

/// WebSocket server pushing tick frames to downstream subscribers.
pub struct BroadcastServer {
    config: BroadcastServerConfig,
    router: Arc<SubscriptionRouter>,
    hub: Arc<SubscriberHub>,
    connector: Arc<UpstreamConnector>,
}

impl BroadcastServer {
    /// Create a server that is not yet listening.
    #[must_use]
    pub const fn new(
        config: BroadcastServerConfig,
        router: Arc<SubscriptionRouter>,
        hub: Arc<SubscriberHub>,
        connector: Arc<UpstreamConnector>,
    ) -> Self {
        Self {
            config,
            router,
            hub,
            connector,
        }
    }

    /// Bind the listen address and serve in a background task.
    ///
    /// # Errors
    ///
    /// Returns [`BroadcastError::BindFailed`] when the address cannot
    /// be bound.
    pub async fn start(self) -> Result<BroadcastServerHandle, BroadcastError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BroadcastError::BindFailed(addr.clone(), e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BroadcastError::BindFailed(addr, e.to_string()))?;

        let cancel = CancellationToken::new();
        let state = Arc::new(ServerState {
            client: self.config.client,
            router: self.router,
            hub: self.hub,
            connector: self.connector,
            subscriber_buffer: self.config.subscriber_buffer.max(1),
            ping_interval: self.config.ping_interval,
            cancel: cancel.clone(),
        });

        let app = Router::new()
            .route("/stream", get(stream_handler))
            .with_state(Arc::clone(&state));

        tracing::info!(client = %state.client, addr = %local_addr, "Broadcast server listening");

        let serve_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(serve_cancel.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "Broadcast server failed");
            }
        });

        Ok(BroadcastServerHandle {
            addr: local_addr,
            cancel,
            task,
        })
    }
}

/// Handle to a running broadcast server.
#[derive(Debug)]
pub struct BroadcastServerHandle {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BroadcastServerHandle {
    /// Address the server is listening on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the server, waiting briefly for in-flight work.
    pub async fn shutdown(self) {
        let Self {
            addr,
            cancel,
            mut task,
        } = self;

        cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(addr = %addr, "Broadcast server did not stop in time, aborting");
            task.abort();
        }
    }
}

// =============================================================================
// Subscriber Handling
// =============================================================================

async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: Arc<ServerState>) {
    let subscriber: SubscriberId = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(state.subscriber_buffer);
    let ping_tx = tx.clone();
    state.hub.register(subscriber, tx);
    metrics::set_subscribers_active(state.hub.subscriber_count());
    tracing::info!(client = %state.client, subscriber = %subscriber, "Subscriber connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut ping = tokio::time::interval(state.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Three missed pings in a row and the subscriber is gone
    let pong_deadline = state.ping_interval * 3;
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => break,

            _ = ping.tick() => {
                if last_pong.elapsed() > pong_deadline {
                    tracing::info!(subscriber = %subscriber, "Subscriber stopped responding to pings");
                    break;
                }
                if ping_tx.try_send(Message::Ping(Vec::new().into())).is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    apply_interest(&state, subscriber, text.as_str()).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    last_pong = tokio::time::Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber = %subscriber, error = %e, "Subscriber socket error");
                    break;
                }
            },
        }
    }

    state.hub.unregister(subscriber);
    let dropped = state.router.subscriber_disconnected(subscriber);
    apply_changes(&state, &dropped).await;
    send_task.abort();
    metrics::set_subscribers_active(state.hub.subscriber_count());
    metrics::set_symbols_active(state.router.stats().symbol_count);
    tracing::info!(client = %state.client, subscriber = %subscriber, "Subscriber disconnected");
}

/// Replace the subscriber's interest set with the declared one.
async fn apply_interest(state: &ServerState, subscriber: SubscriberId, text: &str) {
    let message: InterestMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(subscriber = %subscriber, error = %e, "Ignoring malformed interest message");
            return;
        }
    };

    let desired: HashSet<String> = message.params.symbol.into_iter().collect();
    let changes = state.router.set_subscriptions(subscriber, &desired);
    tracing::debug!(
        client = %state.client,
        subscriber = %subscriber,
        symbols = desired.len(),
        "Subscriber interest updated"
    );

    apply_changes(state, &changes).await;
    metrics::set_symbols_active(state.router.stats().symbol_count);
}

/// Forward first-watcher and last-watcher transitions upstream.
async fn apply_changes(state: &ServerState, changes: &SubscriptionChanges) {
    let subscribe = changes.subscribe_batch();
    if !subscribe.is_empty()
        && let Err(e) = state.connector.subscribe(subscribe).await
    {
        tracing::warn!(client = %state.client, error = %e, "Upstream subscribe failed");
    }

    let unsubscribe = changes.unsubscribe_batch();
    if !unsubscribe.is_empty()
        && let Err(e) = state.connector.unsubscribe(unsubscribe).await
    {
        tracing::warn!(client = %state.client, error = %e, "Upstream unsubscribe failed");
    }
}

// =============================================================================
// Tests
// =============================================================================
