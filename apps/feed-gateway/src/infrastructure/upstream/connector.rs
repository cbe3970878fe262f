//! Upstream Connection Lifecycle
//!
//! [`UpstreamConnector`] owns one upstream feed session and drives it
//! through a fixed state machine:
//!
//! ```text
//!                    connect()                 enter_broadcasting()
//! Disconnected ──────────────────▶ Connected ◀────────────────────▶ Broadcasting
//!      ▲  ▲                          │   ▲                              │
//!      │  │ connect() failed         │   │ reconnect succeeded          │
//!      │  └──────── Connecting ◀─────┼───┼──────────────────────────────┤
//!      │                             │   │                              │
//!      │              socket closed  ▼   │                              ▼
//!      │                          Reconnecting ◀── socket closed ───────┘
//!      │                             │
//!      │   disconnect()              │ auth rejected
//!      └────────────▶ Stopped ◀──────┘
//!
//! kill(): any state ──▶ Killed (terminal)
//! ```
//!
//! # Receive Thread
//!
//! Each connected session runs its receive loop on a dedicated OS
//! thread so a slow fan-out path can never stall the socket read. Raw
//! frames cross back into the async runtime through the
//! [`IngestBridge`]; the loop owns no other shared state.
//!
//! # Reconnection
//!
//! The receive loop never reconnects itself. When the socket closes
//! unexpectedly it enqueues [`QueueMessage::Reconnect`] and exits; the
//! drain task calls [`UpstreamConnector::reconnect`], which sleeps a
//! fixed delay (no jitter, no retry cap) before each attempt and, on
//! success, resubscribes every symbol that still has a subscriber in
//! one batched call. Authentication rejections are fatal: the
//! connector records the error, parks in `Stopped`, and gives up.
//!
//! [`QueueMessage::Reconnect`]: crate::infrastructure::ingest::QueueMessage::Reconnect

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::provider::{ProviderError, ProviderSession, UpstreamProvider};
use crate::domain::subscription::SubscriptionRouter;
use crate::infrastructure::ingest::IngestBridge;
use crate::infrastructure::metrics;

/// Buffered control commands in flight toward the session sink.
const SESSION_COMMAND_BUFFER: usize = 32;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by connector lifecycle operations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The feed rejected our credentials. Never retried.
    #[error("upstream authentication failed: {0}")]
    AuthFailed(String),

    /// The feed could not be reached or refused the connection.
    #[error("upstream connect failed: {0}")]
    ConnectFailed(#[source] ProviderError),

    /// The requested operation is not legal in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        /// State the connector was in when the operation was refused.
        state: ConnectionState,
        /// Human-readable name of the refused operation.
        operation: &'static str,
    },

    /// No live session to deliver the command to.
    #[error("not connected to upstream")]
    NotConnected,

    /// The dedicated receive thread could not be spawned.
    #[error("failed to spawn receive thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle states of an upstream connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; initial state, or a failed `connect()`.
    #[default]
    Disconnected,
    /// Dialing and authenticating.
    Connecting,
    /// Live session, no downstream broadcast server.
    Connected,
    /// Live session with the downstream broadcast server up.
    Broadcasting,
    /// Session lost; the fixed-delay reconnect loop is running.
    Reconnecting,
    /// Deliberately stopped, or reconnect gave up on an auth rejection.
    Stopped,
    /// Terminal. The connector releases its resources and stays here.
    Killed,
}

impl ConnectionState {
    /// Whether the connector counts as running for status reporting.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Broadcasting | Self::Reconnecting
        )
    }

    /// Lowercase name used in status output and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Broadcasting => "broadcasting",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Link State
// =============================================================================

/// Shared, observable state of one upstream link.
///
/// Written by the connector and its receive loop, read by status
/// snapshots and the health endpoint.
#[derive(Debug, Default)]
pub struct LinkState {
    state: RwLock<ConnectionState>,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
    last_error: RwLock<Option<String>>,
    broadcast_active: AtomicBool,
}

impl LinkState {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write() = next;
    }

    /// Flip to Connected (or Broadcasting, when the broadcast server is
    /// up), reset the reconnect counter, and clear the last error.
    fn mark_connected(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        *self.last_error.write() = None;
        let next = if self.broadcast_active.load(Ordering::Relaxed) {
            ConnectionState::Broadcasting
        } else {
            ConnectionState::Connected
        };
        self.set_state(next);
    }

    /// Record the most recent error for status reporting.
    pub fn record_error(&self, error: &str) {
        *self.last_error.write() = Some(error.to_string());
    }

    /// The most recent error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn increment_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reconnect attempts since the link was last healthy.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Count one received frame.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Total frames received over the life of the link.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    fn set_broadcast_active(&self, active: bool) {
        self.broadcast_active.store(active, Ordering::Relaxed);
    }

    /// Whether the downstream broadcast server is up.
    #[must_use]
    pub fn broadcast_active(&self) -> bool {
        self.broadcast_active.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Session Plumbing
// =============================================================================

/// Control commands delivered to the receive loop's sink half.
#[derive(Debug)]
enum SessionCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
    session_cancel: CancellationToken,
}

// =============================================================================
// Connector
// =============================================================================

/// Owns one upstream session and its lifecycle state machine.
pub struct UpstreamConnector {
    name: String,
    provider: Arc<dyn UpstreamProvider>,
    router: Arc<SubscriptionRouter>,
    link: Arc<LinkState>,
    bridge: RwLock<Option<Arc<IngestBridge>>>,
    session: Mutex<Option<SessionHandle>>,
    reconnect_delay: Duration,
    drain_timeout: Duration,
    cancel: CancellationToken,
}

impl UpstreamConnector {
    /// Create a connector in the `Disconnected` state.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn UpstreamProvider>,
        router: Arc<SubscriptionRouter>,
        reconnect_delay: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            router,
            link: Arc::new(LinkState::default()),
            bridge: RwLock::new(None),
            session: Mutex::new(None),
            reconnect_delay,
            drain_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Client name this connector serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared link state for status snapshots.
    #[must_use]
    pub fn link(&self) -> Arc<LinkState> {
        Arc::clone(&self.link)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Dial the feed, authenticate, and start the receive thread.
    ///
    /// Legal from `Disconnected` or `Stopped`. Received frames flow
    /// into `bridge`; the caller owns the consuming end. An auth
    /// rejection surfaces as [`ConnectorError::AuthFailed`] and is
    /// never retried; any other failure leaves the connector
    /// `Disconnected` with the error recorded.
    ///
    /// # Errors
    ///
    /// Returns an error when called in the wrong state or when the
    /// provider cannot establish a session.
    pub async fn connect(&self, bridge: Arc<IngestBridge>) -> Result<(), ConnectorError> {
        let state = self.link.state();
        if !matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Stopped
        ) {
            return Err(ConnectorError::InvalidTransition {
                state,
                operation: "connect",
            });
        }

        self.link.set_state(ConnectionState::Connecting);
        *self.bridge.write() = Some(Arc::clone(&bridge));

        match self.provider.connect().await {
            Ok(session) => {
                if let Err(e) = self.spawn_receive_loop(session, bridge) {
                    self.link.record_error(&e.to_string());
                    self.link.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                self.link.mark_connected();
                tracing::info!(client = %self.name, provider = %self.provider.id(), "Upstream connected");
                Ok(())
            }
            Err(e) if e.is_auth() => {
                let reason = e.to_string();
                self.link.record_error(&reason);
                self.link.set_state(ConnectionState::Disconnected);
                tracing::error!(client = %self.name, error = %reason, "Upstream authentication failed");
                Err(ConnectorError::AuthFailed(reason))
            }
            Err(e) => {
                self.link.record_error(&e.to_string());
                self.link.set_state(ConnectionState::Disconnected);
                tracing::warn!(client = %self.name, error = %e, "Upstream connect failed");
                Err(ConnectorError::ConnectFailed(e))
            }
        }
    }

    /// Stop the session and park in `Stopped`.
    ///
    /// Joins the receive thread, allowing it the configured drain
    /// timeout before declaring it dead.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidTransition`] unless currently
    /// `Connected`, `Broadcasting`, or `Reconnecting`.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let state = self.link.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Broadcasting | ConnectionState::Reconnecting
        ) {
            return Err(ConnectorError::InvalidTransition {
                state,
                operation: "disconnect",
            });
        }

        self.shutdown_session().await;
        self.link.set_state(ConnectionState::Stopped);
        tracing::info!(client = %self.name, "Upstream disconnected");
        Ok(())
    }

    /// Re-establish the session after an unexpected close.
    ///
    /// Runs until reconnected, killed, or the feed rejects our
    /// credentials. Sleeps the fixed delay before every attempt and
    /// replays the batched subscription set on success.
    pub async fn reconnect(&self) {
        self.reap_session();

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(client = %self.name, "Reconnect abandoned, connector killed");
                return;
            }

            self.link.set_state(ConnectionState::Reconnecting);
            let attempt = self.link.increment_reconnect_attempts();
            metrics::record_reconnect(&self.name);
            tracing::info!(
                client = %self.name,
                attempt,
                delay_secs = self.reconnect_delay.as_secs(),
                "Upstream connection lost, reconnecting"
            );

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(self.reconnect_delay) => {}
            }

            match self.provider.connect().await {
                Ok(session) => {
                    let Some(bridge) = self.bridge.read().clone() else {
                        self.link.set_state(ConnectionState::Stopped);
                        tracing::warn!(client = %self.name, "No ingest bridge, abandoning reconnect");
                        return;
                    };
                    if let Err(e) = self.spawn_receive_loop(session, bridge) {
                        self.link.record_error(&e.to_string());
                        tracing::warn!(client = %self.name, error = %e, "Failed to start receive thread");
                        continue;
                    }
                    self.resubscribe_active().await;
                    self.link.mark_connected();
                    tracing::info!(client = %self.name, "Upstream reconnected");
                    return;
                }
                Err(e) if e.is_auth() => {
                    self.link.record_error(&e.to_string());
                    self.link.set_state(ConnectionState::Stopped);
                    tracing::error!(
                        client = %self.name,
                        error = %e,
                        "Authentication rejected during reconnect, giving up"
                    );
                    return;
                }
                Err(e) => {
                    self.link.record_error(&e.to_string());
                    tracing::warn!(client = %self.name, error = %e, "Reconnect attempt failed");
                }
            }
        }
    }

    /// Replay every symbol that still has a subscriber, in one call.
    async fn resubscribe_active(&self) {
        let symbols = self.router.active_symbols();
        if symbols.is_empty() {
            return;
        }
        let count = symbols.len();
        match self.send_command(SessionCommand::Subscribe(symbols)).await {
            Ok(()) => {
                tracing::info!(client = %self.name, count, "Resubscribed active symbols");
            }
            Err(e) => {
                tracing::warn!(client = %self.name, error = %e, "Resubscribe failed");
            }
        }
    }

    /// Send an upstream subscribe for `symbols`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NotConnected`] without a live session.
    pub async fn subscribe(&self, symbols: Vec<String>) -> Result<(), ConnectorError> {
        self.send_command(SessionCommand::Subscribe(symbols)).await
    }

    /// Send an upstream unsubscribe for `symbols`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NotConnected`] without a live session.
    pub async fn unsubscribe(&self, symbols: Vec<String>) -> Result<(), ConnectorError> {
        self.send_command(SessionCommand::Unsubscribe(symbols)).await
    }

    /// Record that the downstream broadcast server is up.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidTransition`] unless currently
    /// `Connected`.
    pub fn enter_broadcasting(&self) -> Result<(), ConnectorError> {
        let state = self.link.state();
        if state != ConnectionState::Connected {
            return Err(ConnectorError::InvalidTransition {
                state,
                operation: "start broadcasting",
            });
        }
        self.link.set_broadcast_active(true);
        self.link.set_state(ConnectionState::Broadcasting);
        Ok(())
    }

    /// Record that the downstream broadcast server is gone.
    ///
    /// Tolerant of any state; a reconnecting link simply comes back as
    /// `Connected` instead of `Broadcasting`.
    pub fn exit_broadcasting(&self) {
        self.link.set_broadcast_active(false);
        if self.link.state() == ConnectionState::Broadcasting {
            self.link.set_state(ConnectionState::Connected);
        }
    }

    /// Tear everything down and park in `Killed`. Idempotent.
    pub async fn kill(&self) {
        self.cancel.cancel();
        self.shutdown_session().await;
        self.link.set_state(ConnectionState::Killed);
        tracing::info!(client = %self.name, "Upstream connector killed");
    }

    fn spawn_receive_loop(
        &self,
        session: ProviderSession,
        bridge: Arc<IngestBridge>,
    ) -> Result<(), ConnectorError> {
        let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_COMMAND_BUFFER);
        let session_cancel = self.cancel.child_token();
        let runtime = tokio::runtime::Handle::current();
        let link = Arc::clone(&self.link);
        let client = self.name.clone();
        let loop_cancel = session_cancel.clone();

        let thread = std::thread::Builder::new()
            .name(format!("{}-upstream-recv", self.name))
            .spawn(move || {
                runtime.block_on(session_loop(session, cmd_rx, loop_cancel, bridge, link, client));
            })?;

        *self.session.lock() = Some(SessionHandle {
            cmd_tx,
            thread: Some(thread),
            session_cancel,
        });
        Ok(())
    }

    async fn send_command(&self, command: SessionCommand) -> Result<(), ConnectorError> {
        let tx = self.session.lock().as_ref().map(|h| h.cmd_tx.clone());
        let Some(tx) = tx else {
            return Err(ConnectorError::NotConnected);
        };
        tx.send(command)
            .await
            .map_err(|_| ConnectorError::NotConnected)
    }

    /// Cancel the session and join the receive thread, bounded by the
    /// drain timeout.
    async fn shutdown_session(&self) {
        let handle = self.session.lock().take();
        let Some(mut handle) = handle else { return };

        handle.session_cancel.cancel();
        let _ = handle.cmd_tx.try_send(SessionCommand::Close);

        if let Some(thread) = handle.thread.take() {
            let join = tokio::task::spawn_blocking(move || thread.join());
            if tokio::time::timeout(self.drain_timeout, join).await.is_err() {
                tracing::warn!(
                    client = %self.name,
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Receive thread did not exit within the drain timeout"
                );
            }
        }
    }

    /// Collect the handle of a receive thread that exited on its own.
    fn reap_session(&self) {
        let Some(mut handle) = self.session.lock().take() else {
            return;
        };
        handle.session_cancel.cancel();
        if let Some(thread) = handle.thread.take()
            && thread.is_finished()
        {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for UpstreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnector")
            .field("name", &self.name)
            .field("provider", &self.provider.id())
            .field("state", &self.link.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Receive Loop
// =============================================================================

/// Pump frames from the session into the ingest bridge until the
/// socket closes or the session is cancelled.
///
/// A deliberate close (cancellation or an explicit `Close` command)
/// ends the loop silently; an unexpected close enqueues the reconnect
/// sentinel before exiting.
async fn session_loop(
    session: ProviderSession,
    mut commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
    bridge: Arc<IngestBridge>,
    link: Arc<LinkState>,
    client: String,
) {
    let ProviderSession {
        mut sink,
        mut stream,
    } = session;
    let mut deliberate_close = false;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                if let Err(e) = sink.close().await {
                    tracing::debug!(client = %client, error = %e, "Error closing upstream socket");
                }
                deliberate_close = true;
                break;
            }
            command = commands.recv() => match command {
                Some(SessionCommand::Subscribe(symbols)) => {
                    if let Err(e) = sink.subscribe(&symbols).await {
                        link.record_error(&e.to_string());
                        tracing::warn!(client = %client, error = %e, "Upstream subscribe failed");
                    }
                }
                Some(SessionCommand::Unsubscribe(symbols)) => {
                    if let Err(e) = sink.unsubscribe(&symbols).await {
                        link.record_error(&e.to_string());
                        tracing::warn!(client = %client, error = %e, "Upstream unsubscribe failed");
                    }
                }
                Some(SessionCommand::Close) | None => {
                    if let Err(e) = sink.close().await {
                        tracing::debug!(client = %client, error = %e, "Error closing upstream socket");
                    }
                    deliberate_close = true;
                    break;
                }
            },
            frame = stream.recv() => match frame {
                Ok(Some(payload)) => {
                    link.increment_messages();
                    bridge.push_payload(payload);
                }
                Ok(None) => {
                    tracing::info!(client = %client, "Upstream closed the connection");
                    break;
                }
                Err(e) => {
                    link.record_error(&e.to_string());
                    tracing::warn!(client = %client, error = %e, "Upstream receive error");
                    break;
                }
            },
        }
    }

    if !deliberate_close {
        bridge.push_reconnect().await;
    }
    tracing::debug!(client = %client, "Receive loop exited");
}

// =============================================================================
// Tests
// =============================================================================
