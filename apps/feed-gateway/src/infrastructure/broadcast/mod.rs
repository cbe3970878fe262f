//! Downstream Fan-Out
//!
//! Consumes raw frames from the [`IngestBridge`], persists them when a
//! capture store is attached, and routes decoded ticks to the
//! WebSocket subscribers currently interested in each symbol.
//!
//! # Architecture
//!
//! - [`SubscriberHub`] holds one bounded sender per connected
//!   subscriber socket. Delivery uses `try_send`: a subscriber that
//!   cannot keep up loses frames rather than stalling the fan-out.
//! - [`Broadcaster`] is the drain task. It owns the consuming end of
//!   the ingest queue, writes every accepted frame to the capture
//!   store before decoding, and hands the reconnect sentinel to the
//!   connector.
//! - [`BroadcastServer`] (in [`server`]) accepts subscriber sockets
//!   and keeps the hub and router in sync with their declared
//!   interest.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::stream::TickFrame;
use crate::domain::subscription::{SubscriberId, SubscriptionRouter};
use crate::infrastructure::capture::CaptureStore;
use crate::infrastructure::ingest::QueueMessage;
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::UpstreamConnector;

pub mod server;

pub use server::{BroadcastServer, BroadcastServerConfig, BroadcastServerHandle};

// =============================================================================
// Errors
// =============================================================================

/// Broadcast server errors.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Failed to bind the listen address.
    #[error("failed to bind broadcast address {0}: {1}")]
    BindFailed(String, String),

    /// The HTTP server failed while running.
    #[error("broadcast server error: {0}")]
    ServerFailed(String),

    /// No broadcast server is running.
    #[error("broadcast server is not running")]
    NotRunning,
}

// =============================================================================
// Subscriber Hub
// =============================================================================

/// Registry of live subscriber sockets.
///
/// Each entry maps a subscriber id to the bounded channel feeding its
/// WebSocket send half. Delivery never blocks: a full buffer drops the
/// frame for that subscriber only.
#[derive(Debug, Default)]
pub struct SubscriberHub {
    senders: RwLock<HashMap<SubscriberId, mpsc::Sender<Message>>>,
}

impl SubscriberHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber's outbound channel.
    pub fn register(&self, id: SubscriberId, tx: mpsc::Sender<Message>) {
        self.senders.write().insert(id, tx);
    }

    /// Remove a subscriber.
    pub fn unregister(&self, id: SubscriberId) {
        self.senders.write().remove(&id);
    }

    /// Send one text frame to each of the given subscribers.
    ///
    /// Returns how many buffers accepted the frame.
    pub fn send_text(&self, ids: &[SubscriberId], text: &str) -> usize {
        if ids.is_empty() {
            return 0;
        }

        let message = Message::Text(text.to_owned().into());
        let senders = self.senders.read();
        let mut delivered = 0;
        for id in ids {
            let Some(tx) = senders.get(id) else { continue };
            if tx.try_send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(subscriber = %id, "Subscriber buffer full, dropping frame");
            }
        }
        delivered
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.senders.read().len()
    }
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Drain task bridging the ingest queue to capture and fan-out.
///
/// Frames are captured raw, before decoding, so the persistent log
/// keeps everything the feed sent even when a frame does not parse as
/// a tick. Routing happens after decode: the frame is serialized once
/// and delivered to every subscriber of its symbol.
pub struct Broadcaster {
    client: String,
    router: Arc<SubscriptionRouter>,
    hub: Arc<SubscriberHub>,
    connector: Arc<UpstreamConnector>,
    capture: Option<Arc<CaptureStore>>,
    cancel: CancellationToken,
}

impl Broadcaster {
    /// Create a broadcaster for one client's queue.
    #[must_use]
    pub fn new(
        client: impl Into<String>,
        router: Arc<SubscriptionRouter>,
        hub: Arc<SubscriberHub>,
        connector: Arc<UpstreamConnector>,
        capture: Option<Arc<CaptureStore>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client: client.into(),
            router,
            hub,
            connector,
            capture,
            cancel,
        }
    }

    /// Consume the queue until cancelled or the producer side closes.
    ///
    /// The reconnect sentinel is handed off to its own task so frame
    /// processing continues while the connector re-dials. Whatever is
    /// still queued when the loop stops is drained before returning,
    /// so accepted frames always reach the capture store.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<QueueMessage>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                message = queue.recv() => match message {
                    Some(QueueMessage::Payload(payload)) => self.dispatch(&payload).await,
                    Some(QueueMessage::Reconnect) => {
                        let connector = Arc::clone(&self.connector);
                        tokio::spawn(async move { connector.reconnect().await });
                    }
                    None => break,
                },
            }
        }

        let mut drained = 0_usize;
        while let Ok(message) = queue.try_recv() {
            if let QueueMessage::Payload(payload) = message {
                self.dispatch(&payload).await;
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::debug!(client = %self.client, drained, "Drained queued frames on shutdown");
        }
        tracing::debug!(client = %self.client, "Broadcast drain loop exited");
    }

    async fn dispatch(&self, payload: &str) {
        if let Some(capture) = &self.capture {
            match capture.write_text(payload).await {
                Ok(()) => metrics::record_capture_write(&self.client),
                Err(e) => {
                    tracing::error!(client = %self.client, error = %e, "Capture write failed");
                }
            }
        }

        let frame = match TickFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::trace!(client = %self.client, error = %e, "Skipping undecodable frame");
                return;
            }
        };

        let subscribers = self.router.subscribers_for(&frame.symbol);
        if subscribers.is_empty() {
            return;
        }

        match frame.to_json() {
            Ok(json) => {
                let delivered = self.hub.send_text(&subscribers, &json);
                metrics::record_broadcast_frames(&self.client, delivered as u64);
            }
            Err(e) => {
                tracing::warn!(client = %self.client, symbol = %frame.symbol, error = %e, "Frame serialization failed");
            }
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("client", &self.client)
            .field("capture", &self.capture.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    use super::*;
    use crate::infrastructure::ingest::IngestBridge;
    use crate::infrastructure::upstream::{ProviderError, ProviderSession, UpstreamProvider};

    struct NullProvider;

    #[async_trait]
    impl UpstreamProvider for NullProvider {
        fn id(&self) -> &str {
            "null"
        }

        async fn connect(&self) -> Result<ProviderSession, ProviderError> {
            Err(ProviderError::ConnectFailed("not wired".to_string()))
        }
    }

    fn connector(router: &Arc<SubscriptionRouter>) -> Arc<UpstreamConnector> {
        Arc::new(UpstreamConnector::new(
            "test-client",
            Arc::new(NullProvider),
            Arc::clone(router),
            Duration::from_millis(10),
            Duration::from_millis(100),
        ))
    }

    fn interest(router: &SubscriptionRouter, symbols: &[&str]) -> SubscriberId {
        let id = Uuid::new_v4();
        let desired: HashSet<String> = symbols.iter().map(ToString::to_string).collect();
        router.set_subscriptions(id, &desired);
        id
    }

    #[test]
    fn hub_delivers_to_registered_subscribers() {
        let hub = SubscriberHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        let id = Uuid::new_v4();
        hub.register(id, tx);

        let delivered = hub.send_text(&[id], "frame");

        assert_eq!(delivered, 1);
        assert!(matches!(rx.try_recv(), Ok(Message::Text(text)) if text.as_str() == "frame"));
    }

    #[test]
    fn hub_drops_frames_for_full_buffers() {
        let hub = SubscriberHub::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        hub.register(id, tx);

        assert_eq!(hub.send_text(&[id], "first"), 1);
        assert_eq!(hub.send_text(&[id], "second"), 0);

        assert!(matches!(rx.try_recv(), Ok(Message::Text(text)) if text.as_str() == "first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn hub_ignores_unknown_subscribers() {
        let hub = SubscriberHub::new();
        assert_eq!(hub.send_text(&[Uuid::new_v4()], "frame"), 0);
    }

    #[test]
    fn hub_unregister_removes_subscriber() {
        let hub = SubscriberHub::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = Uuid::new_v4();

        hub.register(id, tx);
        assert_eq!(hub.subscriber_count(), 1);

        hub.unregister(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn broadcaster_routes_frames_by_symbol() {
        let router = Arc::new(SubscriptionRouter::new());
        let hub = Arc::new(SubscriberHub::new());
        let cancel = CancellationToken::new();

        let aapl_watcher = interest(&router, &["AAPL"]);
        let msft_watcher = interest(&router, &["MSFT"]);
        let (aapl_tx, mut aapl_rx) = mpsc::channel(8);
        let (msft_tx, mut msft_rx) = mpsc::channel(8);
        hub.register(aapl_watcher, aapl_tx);
        hub.register(msft_watcher, msft_tx);

        let broadcaster = Arc::new(Broadcaster::new(
            "test-client",
            Arc::clone(&router),
            Arc::clone(&hub),
            connector(&router),
            None,
            cancel.clone(),
        ));
        let (bridge, queue) = IngestBridge::bounded("test-client", 16);
        let task = tokio::spawn(broadcaster.run(queue));

        bridge.push_payload(r#"{"symbol": "AAPL", "price": "187.22"}"#.to_string());

        let delivered = tokio::time::timeout(Duration::from_secs(2), aapl_rx.recv())
            .await
            .expect("frame should arrive")
            .expect("channel open");
        let Message::Text(text) = delivered else {
            panic!("expected text frame");
        };
        assert!(text.as_str().contains("\"AAPL\""));
        assert!(msft_rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn broadcaster_captures_raw_frames_before_decode() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            CaptureStore::new(
                dir.path().join("capture.db").to_string_lossy(),
                "capture",
                0,
            )
            .unwrap(),
        );
        store.prepare().await.unwrap();

        let router = Arc::new(SubscriptionRouter::new());
        let hub = Arc::new(SubscriberHub::new());
        let cancel = CancellationToken::new();
        let broadcaster = Arc::new(Broadcaster::new(
            "test-client",
            Arc::clone(&router),
            Arc::clone(&hub),
            connector(&router),
            Some(Arc::clone(&store)),
            cancel.clone(),
        ));
        let (bridge, queue) = IngestBridge::bounded("test-client", 16);
        let task = tokio::spawn(broadcaster.run(queue));

        // One decodable tick and one control frame no subscriber wants
        bridge.push_payload(r#"{"symbol": "AAPL", "price": "187.22"}"#.to_string());
        bridge.push_payload(r#"{"status": "heartbeat"}"#.to_string());

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        let records = store.fetch_all(None).await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
