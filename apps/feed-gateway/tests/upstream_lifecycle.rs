//! Upstream Lifecycle Integration Tests
//!
//! Exercises session teardown, automatic reconnection, and resubscribe
//! behavior through a scripted provider.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use feed_gateway::{AuthToken, FeedClient, ProviderError, StreamingClient, UpstreamProvider};
use support::{ScriptedProvider, SessionScript, SinkCall, fast_settings};

async fn connected_client(
    symbols: &[&str],
    outcomes: Vec<Result<(), ProviderError>>,
) -> (
    FeedClient,
    Arc<ScriptedProvider>,
    mpsc::UnboundedReceiver<SessionScript>,
    SessionScript,
) {
    let (provider, mut sessions) = ScriptedProvider::new(outcomes);

    let client = FeedClient::new(
        "t1",
        AuthToken::new("secret"),
        symbols.iter().map(ToString::to_string).collect(),
        Arc::clone(&provider) as Arc<dyn UpstreamProvider>,
        fast_settings(),
        false,
        None,
    )
    .unwrap();

    client.connect().await.unwrap();

    let script = timeout(Duration::from_secs(2), sessions.recv())
        .await
        .expect("timeout waiting for session")
        .expect("no session");

    (client, provider, sessions, script)
}

// =============================================================================
// Initial Subscription Tests
// =============================================================================

#[tokio::test]
async fn test_connect_subscribes_requested_symbols_in_one_batch() {
    let (client, provider, _sessions, mut script) =
        connected_client(&["ETHUSD", "BTCUSD"], vec![]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;

    let calls = script.drain_calls();
    assert_eq!(
        calls,
        vec![SinkCall::Subscribe(vec![
            "BTCUSD".to_string(),
            "ETHUSD".to_string()
        ])]
    );
    assert_eq!(provider.connect_count(), 1);
    assert!(client.is_running());

    client.kill().await;
}

// =============================================================================
// Reconnect Tests
// =============================================================================

#[tokio::test]
async fn test_closed_stream_reconnects_and_resubscribes_once() {
    let (client, provider, mut sessions, mut script) =
        connected_client(&["BTCUSD", "ETHUSD"], vec![]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = script.drain_calls();

    // Feed closes the stream
    drop(script);

    let mut replacement = timeout(Duration::from_secs(2), sessions.recv())
        .await
        .expect("timeout waiting for reconnect session")
        .expect("no reconnect session");

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Every active symbol comes back in exactly one batched subscribe
    let calls = replacement.drain_calls();
    assert_eq!(
        calls,
        vec![SinkCall::Subscribe(vec![
            "BTCUSD".to_string(),
            "ETHUSD".to_string()
        ])]
    );
    assert_eq!(provider.connect_count(), 2);
    assert!(client.is_running());

    client.kill().await;
}

#[tokio::test]
async fn test_transient_connect_failure_retries_until_success() {
    let (client, provider, mut sessions, script) = connected_client(
        &["BTCUSD"],
        vec![
            Ok(()),
            Err(ProviderError::ConnectFailed("connection refused".to_string())),
            Ok(()),
        ],
    )
    .await;

    drop(script);

    let mut replacement = timeout(Duration::from_secs(2), sessions.recv())
        .await
        .expect("timeout waiting for reconnect session")
        .expect("no reconnect session");

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(provider.connect_count(), 3);
    assert!(client.is_running());
    assert_eq!(client.status().last_error, None);
    assert_eq!(
        replacement.drain_calls(),
        vec![SinkCall::Subscribe(vec!["BTCUSD".to_string()])]
    );

    client.kill().await;
}

#[tokio::test]
async fn test_auth_rejection_during_reconnect_gives_up() {
    let (client, provider, mut sessions, script) = connected_client(
        &["BTCUSD"],
        vec![
            Ok(()),
            Err(ProviderError::AuthRejected("token expired".to_string())),
        ],
    )
    .await;

    drop(script);

    // One failed attempt, then the connector stops for good
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(provider.connect_count(), 2);
    assert!(!client.is_running());
    assert_eq!(
        client.status().last_error.as_deref(),
        Some("authentication rejected: token expired")
    );
    assert!(sessions.try_recv().is_err());

    client.kill().await;
}

// =============================================================================
// Deliberate Teardown Tests
// =============================================================================

#[tokio::test]
async fn test_disconnect_closes_session_without_reconnecting() {
    let (client, provider, mut sessions, mut script) =
        connected_client(&["BTCUSD"], vec![]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = script.drain_calls();

    client.disconnect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let calls = script.drain_calls();
    assert!(calls.contains(&SinkCall::Close));
    assert_eq!(provider.connect_count(), 1);
    assert!(sessions.try_recv().is_err());
    assert!(!client.is_running());

    client.kill().await;
}

#[tokio::test]
async fn test_reconnect_after_restart_preserves_symbols() {
    let (client, provider, mut sessions, mut script) =
        connected_client(&["BTCUSD"], vec![]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = script.drain_calls();

    client.disconnect().await.unwrap();
    client.connect().await.unwrap();

    let mut restarted = timeout(Duration::from_secs(2), sessions.recv())
        .await
        .expect("timeout waiting for restart session")
        .expect("no restart session");

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(provider.connect_count(), 2);
    assert!(client.is_running());
    assert_eq!(
        restarted.drain_calls(),
        vec![SinkCall::Subscribe(vec!["BTCUSD".to_string()])]
    );

    client.kill().await;
}
