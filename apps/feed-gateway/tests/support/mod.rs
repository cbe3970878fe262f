//! Shared scripted doubles for the integration suites.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use feed_gateway::{
    ClientSettings, ProviderError, ProviderFactory, ProviderRequest, ProviderSession, SessionSink,
    SessionStream, UpstreamProvider,
};

/// One observed call on a scripted session sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCall {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

struct ScriptedSink {
    calls: mpsc::UnboundedSender<SinkCall>,
}

#[async_trait]
impl SessionSink for ScriptedSink {
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError> {
        let _ = self.calls.send(SinkCall::Subscribe(symbols.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), ProviderError> {
        let _ = self.calls.send(SinkCall::Unsubscribe(symbols.to_vec()));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        let _ = self.calls.send(SinkCall::Close);
        Ok(())
    }
}

struct ScriptedStream {
    frames: mpsc::UnboundedReceiver<Result<String, ProviderError>>,
}

#[async_trait]
impl SessionStream for ScriptedStream {
    async fn recv(&mut self) -> Result<Option<String>, ProviderError> {
        match self.frames.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Test-side handles for one scripted session.
///
/// Dropping the script (and with it `frames`) closes the upstream from
/// the feed side.
pub struct SessionScript {
    /// Calls the receive loop made on the sink, in order.
    pub calls: mpsc::UnboundedReceiver<SinkCall>,
    /// Frames the feed delivers to the receive loop.
    pub frames: mpsc::UnboundedSender<Result<String, ProviderError>>,
}

impl SessionScript {
    /// Collect every sink call observed so far.
    pub fn drain_calls(&mut self) -> Vec<SinkCall> {
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.try_recv() {
            calls.push(call);
        }
        calls
    }
}

/// Build one scripted session plus its test-side handles.
pub fn scripted_session() -> (ProviderSession, SessionScript) {
    let (call_tx, call_rx) = mpsc::unbounded_channel();
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();

    let session = ProviderSession {
        sink: Box::new(ScriptedSink { calls: call_tx }),
        stream: Box::new(ScriptedStream { frames: frame_rx }),
    };
    let script = SessionScript {
        calls: call_rx,
        frames: frame_tx,
    };
    (session, script)
}

/// Provider returning scripted sessions.
///
/// Each `connect` first consumes the next scripted outcome (an empty
/// queue means success), then hands the test a fresh [`SessionScript`]
/// through the channel returned by [`ScriptedProvider::new`].
pub struct ScriptedProvider {
    outcomes: Mutex<VecDeque<Result<(), ProviderError>>>,
    sessions: mpsc::UnboundedSender<SessionScript>,
    connects: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(
        outcomes: Vec<Result<(), ProviderError>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionScript>) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            sessions: session_tx,
            connects: AtomicU32::new(0),
        });
        (provider, session_rx)
    }

    /// How many times `connect` has been called.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn connect(&self) -> Result<ProviderSession, ProviderError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.outcomes.lock().pop_front() {
            outcome?;
        }
        let (session, script) = scripted_session();
        let _ = self.sessions.send(script);
        Ok(session)
    }
}

/// Factory handing out one shared scripted provider.
pub struct ScriptedFactory {
    provider: Arc<ScriptedProvider>,
}

impl ScriptedFactory {
    pub fn new(provider: Arc<ScriptedProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderFactory for ScriptedFactory {
    fn create(
        &self,
        _request: &ProviderRequest,
    ) -> Result<Arc<dyn UpstreamProvider>, ProviderError> {
        Ok(Arc::clone(&self.provider) as Arc<dyn UpstreamProvider>)
    }
}

/// Client settings tuned for fast test turnaround.
pub fn fast_settings() -> ClientSettings {
    ClientSettings {
        reconnect_delay: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(250),
        ..ClientSettings::default()
    }
}

/// Fast settings with captures rooted in a scratch directory.
pub fn fast_settings_with_captures(dir: &Path) -> ClientSettings {
    ClientSettings {
        capture_dir: dir.to_path_buf(),
        ..fast_settings()
    }
}
