//! Streaming Client Aggregate
//!
//! [`FeedClient`] wires one named connection together: the upstream
//! connector, the ingest bridge and its drain task, the subscription
//! router, the optional capture store, and the downstream broadcast
//! server. The [`StreamingClient`] trait is the contract the gateway
//! operates against, so control-surface tests can stand in doubles.
//!
//! # Lifecycle
//!
//! `connect` prepares the capture store, dials upstream through the
//! connector, starts the drain task, and opens upstream subscriptions
//! for every requested symbol. `disconnect` reverses that, bounded by
//! the drain timeout. `kill` is terminal: it exports captured results
//! when an archive file is configured, tears everything down, and
//! leaves the connector in its `Killed` state.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::{SubscriberId, SubscriptionRouter};
use crate::infrastructure::broadcast::{
    BroadcastError, BroadcastServer, BroadcastServerConfig, BroadcastServerHandle, Broadcaster,
    SubscriberHub,
};
use crate::infrastructure::capture::{CaptureError, CaptureRecord, CaptureStore};
use crate::infrastructure::ingest::IngestBridge;
use crate::infrastructure::upstream::{ConnectorError, LinkState, UpstreamConnector, UpstreamProvider};

// =============================================================================
// Auth Token
// =============================================================================

/// Per-client auth token checked on every control operation.
///
/// The raw value never leaves this type: Debug output is redacted and
/// there is deliberately no Display implementation.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Whether `candidate` matches this token.
    #[must_use]
    pub fn verify(&self, candidate: &str) -> bool {
        self.0 == candidate
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(\"[REDACTED]\")")
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Upstream lifecycle failure.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// Capture store failure.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Broadcast server failure.
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    /// The symbol is already in the client's requested set.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// The symbol is not in the client's requested set.
    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// A broadcast server is already running for this client.
    #[error("broadcast server is already running")]
    AlreadyBroadcasting,

    /// Nothing has been captured, or no capture store is attached.
    #[error("no results captured")]
    NoResults,
}

// =============================================================================
// Status and Settings
// =============================================================================

/// Point-in-time snapshot of one client, as returned by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    /// Client name.
    pub name: String,
    /// Whether the upstream link counts as running.
    pub is_running: bool,
    /// Whether the downstream broadcast server is up.
    pub is_broadcasting: bool,
    /// Listen address of the broadcast server, empty when down.
    pub broadcast_address: String,
    /// Requested symbols, comma-joined in sorted order.
    pub symbol: String,
    /// Most recent error on the upstream link, if any.
    pub last_error: Option<String>,
}

/// Tuning shared by every client a gateway creates.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Ingest queue capacity, in frames.
    pub queue_capacity: usize,
    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,
    /// How long stop paths wait for threads and tasks to finish.
    pub drain_timeout: Duration,
    /// Directory holding per-client capture databases.
    pub capture_dir: PathBuf,
    /// Capture table name.
    pub capture_table: String,
    /// Capture retention limit; zero keeps everything.
    pub capture_limit: u64,
    /// Default broadcast bind host.
    pub broadcast_host: String,
    /// Default broadcast bind port.
    pub broadcast_port: u16,
    /// Per-subscriber outbound buffer, in frames.
    pub subscriber_buffer: usize,
    /// Downstream keepalive ping cadence.
    pub ping_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            reconnect_delay: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            capture_dir: PathBuf::from("./captures"),
            capture_table: "capture".to_string(),
            capture_limit: 0,
            broadcast_host: "127.0.0.1".to_string(),
            broadcast_port: 8765,
            subscriber_buffer: 256,
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Client Contract
// =============================================================================

/// Contract the gateway operates against for each named connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamingClient: Send + Sync {
    /// Client name.
    fn name(&self) -> &str;

    /// Whether `token` matches this client's auth token.
    fn verify_token(&self, token: &str) -> bool;

    /// Current status snapshot.
    fn status(&self) -> ClientStatus;

    /// Whether the upstream link counts as running.
    fn is_running(&self) -> bool;

    /// Listen address of the broadcast server, when up.
    fn broadcast_address(&self) -> Option<SocketAddr>;

    /// Number of connected downstream subscribers.
    fn subscriber_count(&self) -> usize;

    /// Establish the upstream session and start the drain task.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Stop the upstream session and the drain task.
    async fn disconnect(&self) -> Result<(), ClientError>;

    /// Add one symbol to the requested set.
    async fn subscribe_symbol(&self, symbol: &str) -> Result<(), ClientError>;

    /// Remove one symbol from the requested set.
    async fn unsubscribe_symbol(&self, symbol: &str) -> Result<(), ClientError>;

    /// Start the downstream broadcast server.
    async fn start_broadcasting(&self, host: &str, port: u16) -> Result<SocketAddr, ClientError>;

    /// Stop the downstream broadcast server.
    async fn stop_broadcasting(&self) -> Result<(), ClientError>;

    /// Captured rows, most recent first.
    async fn results(&self) -> Result<Vec<CaptureRecord>, ClientError>;

    /// Delete all captured rows, returning how many were removed.
    async fn clear_results(&self) -> Result<u64, ClientError>;

    /// Release every resource. Terminal and idempotent.
    async fn kill(&self);
}

// =============================================================================
// Feed Client
// =============================================================================

struct DrainHandle {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Default [`StreamingClient`]: one upstream feed, one optional capture
/// store, one optional downstream broadcast server.
pub struct FeedClient {
    name: String,
    token: AuthToken,
    /// The client's own standing interest in the router, covering the
    /// requested symbol set independent of downstream subscribers.
    self_id: SubscriberId,
    symbols: RwLock<BTreeSet<String>>,
    settings: ClientSettings,
    results_file: Option<PathBuf>,
    router: Arc<SubscriptionRouter>,
    connector: Arc<UpstreamConnector>,
    link: Arc<LinkState>,
    hub: Arc<SubscriberHub>,
    capture: Option<Arc<CaptureStore>>,
    drain: Mutex<Option<DrainHandle>>,
    server: Mutex<Option<BroadcastServerHandle>>,
    broadcast_addr: RwLock<Option<SocketAddr>>,
}

impl FeedClient {
    /// Build a client around the given provider.
    ///
    /// When `save_results` is set the client opens a capture store at
    /// `<capture_dir>/<name>.db`; otherwise frames are fan-out only.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Capture`] when the configured capture
    /// table name is not a valid identifier.
    pub fn new(
        name: impl Into<String>,
        token: AuthToken,
        symbols: Vec<String>,
        provider: Arc<dyn UpstreamProvider>,
        settings: ClientSettings,
        save_results: bool,
        results_file: Option<PathBuf>,
    ) -> Result<Self, ClientError> {
        let name = name.into();
        let router = Arc::new(SubscriptionRouter::new());
        let connector = Arc::new(UpstreamConnector::new(
            name.clone(),
            provider,
            Arc::clone(&router),
            settings.reconnect_delay,
            settings.drain_timeout,
        ));
        let link = connector.link();

        let capture = if save_results {
            let path = settings.capture_dir.join(format!("{name}.db"));
            Some(Arc::new(CaptureStore::new(
                path.to_string_lossy(),
                settings.capture_table.clone(),
                settings.capture_limit,
            )?))
        } else {
            None
        };

        Ok(Self {
            name,
            token,
            self_id: uuid::Uuid::new_v4(),
            symbols: RwLock::new(symbols.into_iter().collect()),
            settings,
            results_file,
            router,
            connector,
            link,
            hub: Arc::new(SubscriberHub::new()),
            capture,
            drain: Mutex::new(None),
            server: Mutex::new(None),
            broadcast_addr: RwLock::new(None),
        })
    }

    fn requested_symbols(&self) -> HashSet<String> {
        self.symbols.read().iter().cloned().collect()
    }

    async fn stop_drain(&self) {
        let handle = self.drain.lock().await.take();
        let Some(DrainHandle { mut task, cancel }) = handle else {
            return;
        };

        cancel.cancel();
        if tokio::time::timeout(self.settings.drain_timeout, &mut task)
            .await
            .is_err()
        {
            tracing::warn!(client = %self.name, "Drain task did not stop in time, aborting");
            task.abort();
        }
    }
}

#[async_trait]
impl StreamingClient for FeedClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn verify_token(&self, token: &str) -> bool {
        self.token.verify(token)
    }

    fn status(&self) -> ClientStatus {
        let broadcast_address = *self.broadcast_addr.read();
        ClientStatus {
            name: self.name.clone(),
            is_running: self.link.state().is_running(),
            is_broadcasting: broadcast_address.is_some(),
            broadcast_address: broadcast_address.map(|a| a.to_string()).unwrap_or_default(),
            symbol: self
                .symbols
                .read()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(","),
            last_error: self.link.last_error(),
        }
    }

    fn is_running(&self) -> bool {
        self.link.state().is_running()
    }

    fn broadcast_address(&self) -> Option<SocketAddr> {
        *self.broadcast_addr.read()
    }

    fn subscriber_count(&self) -> usize {
        self.hub.subscriber_count()
    }

    async fn connect(&self) -> Result<(), ClientError> {
        if let Some(capture) = &self.capture {
            // Storage setup failures are fatal to connect
            capture.prepare().await?;
        }

        let (bridge, queue) = IngestBridge::bounded(self.name.clone(), self.settings.queue_capacity);
        self.connector.connect(bridge).await?;

        let drain_cancel = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new(
            self.name.clone(),
            Arc::clone(&self.router),
            Arc::clone(&self.hub),
            Arc::clone(&self.connector),
            self.capture.clone(),
            drain_cancel.clone(),
        ));
        let task = tokio::spawn(broadcaster.run(queue));
        *self.drain.lock().await = Some(DrainHandle {
            task,
            cancel: drain_cancel,
        });

        // Open upstream subscriptions for the requested set plus
        // whatever downstream subscribers already registered
        self.router
            .set_subscriptions(self.self_id, &self.requested_symbols());
        let active = self.router.active_symbols();
        if !active.is_empty() {
            self.connector.subscribe(active).await?;
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        self.connector.disconnect().await?;
        self.stop_drain().await;
        Ok(())
    }

    async fn subscribe_symbol(&self, symbol: &str) -> Result<(), ClientError> {
        if !self.symbols.write().insert(symbol.to_string()) {
            return Err(ClientError::AlreadySubscribed(symbol.to_string()));
        }

        let changes = self
            .router
            .set_subscriptions(self.self_id, &self.requested_symbols());
        let batch = changes.subscribe_batch();
        if !batch.is_empty() {
            // Intent is kept on failure; reconnect replays it
            self.connector.subscribe(batch).await?;
        }
        Ok(())
    }

    async fn unsubscribe_symbol(&self, symbol: &str) -> Result<(), ClientError> {
        if !self.symbols.write().remove(symbol) {
            return Err(ClientError::NotSubscribed(symbol.to_string()));
        }

        let changes = self
            .router
            .set_subscriptions(self.self_id, &self.requested_symbols());
        let batch = changes.unsubscribe_batch();
        if !batch.is_empty() {
            self.connector.unsubscribe(batch).await?;
        }
        Ok(())
    }

    async fn start_broadcasting(&self, host: &str, port: u16) -> Result<SocketAddr, ClientError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Err(ClientError::AlreadyBroadcasting);
        }

        let config = BroadcastServerConfig {
            client: self.name.clone(),
            host: host.to_string(),
            port,
            subscriber_buffer: self.settings.subscriber_buffer,
            ping_interval: self.settings.ping_interval,
        };
        let handle = BroadcastServer::new(
            config,
            Arc::clone(&self.router),
            Arc::clone(&self.hub),
            Arc::clone(&self.connector),
        )
        .start()
        .await?;

        if let Err(e) = self.connector.enter_broadcasting() {
            handle.shutdown().await;
            return Err(e.into());
        }

        let addr = handle.addr();
        *server = Some(handle);
        *self.broadcast_addr.write() = Some(addr);
        Ok(addr)
    }

    async fn stop_broadcasting(&self) -> Result<(), ClientError> {
        let handle = self.server.lock().await.take();
        let Some(handle) = handle else {
            return Err(ClientError::Broadcast(BroadcastError::NotRunning));
        };

        *self.broadcast_addr.write() = None;
        handle.shutdown().await;
        self.connector.exit_broadcasting();
        tracing::info!(client = %self.name, "Broadcast server stopped");
        Ok(())
    }

    async fn results(&self) -> Result<Vec<CaptureRecord>, ClientError> {
        let Some(capture) = &self.capture else {
            return Err(ClientError::NoResults);
        };
        let records = capture.fetch_all(None).await?;
        if records.is_empty() {
            return Err(ClientError::NoResults);
        }
        Ok(records)
    }

    async fn clear_results(&self) -> Result<u64, ClientError> {
        match &self.capture {
            Some(capture) => Ok(capture.clear().await?),
            None => Ok(0),
        }
    }

    async fn kill(&self) {
        if let (Some(capture), Some(path)) = (&self.capture, &self.results_file) {
            match capture.export(path).await {
                Ok(count) => {
                    tracing::info!(
                        client = %self.name,
                        count,
                        path = %path.display(),
                        "Exported captured results"
                    );
                }
                Err(e) => {
                    tracing::error!(client = %self.name, error = %e, "Result export failed");
                }
            }
        }

        if let Some(handle) = self.server.lock().await.take() {
            handle.shutdown().await;
        }
        *self.broadcast_addr.write() = None;
        self.connector.kill().await;
        self.stop_drain().await;
        tracing::info!(client = %self.name, "Client killed");
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("name", &self.name)
            .field("state", &self.link.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
