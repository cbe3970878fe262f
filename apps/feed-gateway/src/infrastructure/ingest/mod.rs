//! Ingest Bridge
//!
//! Bounded queue decoupling the upstream receive loop from the
//! broadcaster. The receive loop must never block on downstream work,
//! so payload pushes are non-blocking: when the queue is full the
//! payload is dropped, counted, and reported through a rate-limited
//! warning rather than applying backpressure to the socket.
//!
//! Reconnect sentinels take the opposite contract. Losing one would
//! strand a dead connection forever, so the sentinel push awaits queue
//! capacity and is never dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::infrastructure::metrics;

/// Minimum gap between queue-full warnings.
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Queue Messages
// =============================================================================

/// Messages flowing from the receive loop to the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMessage {
    /// A raw upstream payload to route and persist.
    Payload(String),
    /// The upstream connection died; the broadcaster must start a
    /// reconnect.
    Reconnect,
}

// =============================================================================
// Ingest Bridge
// =============================================================================

/// Producer half of the bounded ingest queue.
///
/// Cheap to clone via `Arc`; the receive loop holds one while the
/// broadcaster consumes the paired receiver.
#[derive(Debug)]
pub struct IngestBridge {
    client: String,
    tx: mpsc::Sender<QueueMessage>,
    dropped: AtomicU64,
    last_drop_log: Mutex<Option<Instant>>,
}

impl IngestBridge {
    /// Create a bounded bridge for the named client.
    ///
    /// Returns the producer and the receiver the broadcaster drains.
    #[must_use]
    pub fn bounded(
        client: impl Into<String>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<QueueMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bridge = Arc::new(Self {
            client: client.into(),
            tx,
            dropped: AtomicU64::new(0),
            last_drop_log: Mutex::new(None),
        });
        (bridge, rx)
    }

    /// Push an upstream payload without blocking.
    ///
    /// Drops the payload when the queue is full. The drop is counted
    /// and surfaced through a warning at most once per second.
    pub fn push_payload(&self, payload: String) {
        match self.tx.try_send(QueueMessage::Payload(payload)) {
            Ok(()) => metrics::record_ingest_message(&self.client),
            Err(mpsc::error::TrySendError::Full(_)) => self.note_drop(),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Broadcaster already gone; normal during shutdown.
                tracing::trace!(client = %self.client, "Ingest queue closed, payload discarded");
            }
        }
    }

    /// Push the reconnect sentinel, waiting for capacity if needed.
    ///
    /// Unlike payloads, the sentinel is never dropped: the broadcaster
    /// must learn that the connection died.
    pub async fn push_reconnect(&self) {
        if self.tx.send(QueueMessage::Reconnect).await.is_err() {
            tracing::debug!(
                client = %self.client,
                "Ingest queue closed before reconnect sentinel was delivered"
            );
        }
    }

    /// Total payloads dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn note_drop(&self) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_ingest_dropped(&self.client);

        let now = Instant::now();
        let mut last = self.last_drop_log.lock();
        if last.is_none_or(|at| now.duration_since(at) >= DROP_LOG_INTERVAL) {
            *last = Some(now);
            tracing::warn!(
                client = %self.client,
                dropped_total = total,
                "Ingest queue full, dropping payloads"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
