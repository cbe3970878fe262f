//! Connection Gateway
//!
//! The control surface over every named client. Each operation takes
//! a client name plus that client's auth token (status queries are
//! token-free), resolves the client in the registry, verifies the
//! token, delegates, and returns a refreshed status snapshot.
//!
//! The registry owns its clients exclusively: `kill` removes the entry
//! before releasing resources, so a name is immediately reusable and a
//! second `kill` on it reports not-found. Errors are logged with their
//! operation and client before being returned; auth tokens are never
//! part of any log event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use super::client::{
    AuthToken, ClientError, ClientSettings, ClientStatus, FeedClient, StreamingClient,
};
use crate::infrastructure::broadcast::BroadcastError;
use crate::infrastructure::capture::{CaptureError, CaptureRecord};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{ConnectorError, ProviderError, ProviderFactory, ProviderRequest};

/// Name reserved for querying every client at once.
const ALL_CLIENTS: &str = "all";

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced by gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The auth token in the request is empty.
    #[error("auth token must not be empty")]
    EmptyToken,

    /// The presented token does not match the client's token.
    #[error("invalid auth token for client '{0}'")]
    AuthRejected(String),

    /// No client registered under the name.
    #[error("no client named '{0}'")]
    NotFound(String),

    /// A client with this name is registered and still active.
    #[error("client '{0}' already exists and is active")]
    AlreadyExists(String),

    /// The client name is empty, reserved, or not a bare identifier.
    #[error("invalid client name '{0}'")]
    InvalidName(String),

    /// The symbol is already in the client's requested set.
    #[error("client '{name}' is already subscribed to {symbol}")]
    AlreadySubscribed {
        /// Client name.
        name: String,
        /// Offending symbol.
        symbol: String,
    },

    /// The symbol is not in the client's requested set.
    #[error("client '{name}' is not subscribed to {symbol}")]
    NotSubscribed {
        /// Client name.
        name: String,
        /// Offending symbol.
        symbol: String,
    },

    /// The registry holds no clients at all.
    #[error("no clients registered")]
    NoClients,

    /// Nothing has been captured for the client.
    #[error("no results captured for client '{0}'")]
    EmptyResult(String),

    /// The client has no broadcast server running.
    #[error("client '{0}' is not broadcasting")]
    NotBroadcasting(String),

    /// The client's upstream session is gone.
    #[error("upstream connection closed for client '{name}': {reason}")]
    UpstreamClosed {
        /// Client name.
        name: String,
        /// Why the session is unavailable.
        reason: String,
    },

    /// Capture payload failed its integrity check.
    #[error("capture integrity failure for client '{name}': {source}")]
    StorageIntegrity {
        /// Client name.
        name: String,
        /// Underlying capture error.
        source: CaptureError,
    },

    /// No provider registered under the requested id.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Provider construction failed.
    #[error("provider error: {0}")]
    Provider(ProviderError),

    /// Any other client failure, wrapped with the client name.
    #[error("client '{name}': {source}")]
    Client {
        /// Client name.
        name: String,
        /// Underlying client error.
        source: ClientError,
    },
}

fn map_client_error(name: &str, error: ClientError) -> GatewayError {
    match error {
        ClientError::AlreadySubscribed(symbol) => GatewayError::AlreadySubscribed {
            name: name.to_string(),
            symbol,
        },
        ClientError::NotSubscribed(symbol) => GatewayError::NotSubscribed {
            name: name.to_string(),
            symbol,
        },
        ClientError::NoResults => GatewayError::EmptyResult(name.to_string()),
        ClientError::Broadcast(BroadcastError::NotRunning) => {
            GatewayError::NotBroadcasting(name.to_string())
        }
        ClientError::Connector(ConnectorError::NotConnected) => GatewayError::UpstreamClosed {
            name: name.to_string(),
            reason: "not connected to upstream".to_string(),
        },
        ClientError::Capture(
            source @ (CaptureError::SignatureMismatch | CaptureError::MalformedEnvelope(_)),
        ) => GatewayError::StorageIntegrity {
            name: name.to_string(),
            source,
        },
        source => GatewayError::Client {
            name: name.to_string(),
            source,
        },
    }
}

fn map_provider_error(error: ProviderError) -> GatewayError {
    match error {
        ProviderError::UnknownProvider(provider) => GatewayError::UnknownProvider(provider),
        other => GatewayError::Provider(other),
    }
}

/// Map, log, and return a failed client operation.
fn op_failed(name: &str, operation: &'static str, error: ClientError) -> GatewayError {
    let mapped = map_client_error(name, error);
    tracing::warn!(client = %name, operation, error = %mapped, "Gateway operation failed");
    mapped
}

// =============================================================================
// Requests and Confirmations
// =============================================================================

/// Everything `create_connection` needs for one new client.
#[derive(Clone, Default)]
pub struct ConnectionRequest {
    /// Registry name for the new client.
    pub name: String,
    /// Provider id resolved through the factory.
    pub provider: String,
    /// Optional asset-type path segment for the provider.
    pub asset_type: Option<String>,
    /// Optional feed path segment for the provider.
    pub feed: Option<String>,
    /// Symbols to subscribe immediately.
    pub symbols: Vec<String>,
    /// Stand up the broadcast server right after connecting.
    pub start_broadcast: bool,
    /// Broadcast host override; gateway default when `None`.
    pub broadcast_host: Option<String>,
    /// Broadcast port override; gateway default when `None`.
    pub broadcast_port: Option<u16>,
    /// Persist every received frame to a capture store.
    pub save_results: bool,
    /// Export the capture store here when the client is killed.
    pub results_file: Option<PathBuf>,
    /// Token required by every later operation on this client.
    pub auth_token: String,
}

impl std::fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("asset_type", &self.asset_type)
            .field("feed", &self.feed)
            .field("symbols", &self.symbols)
            .field("start_broadcast", &self.start_broadcast)
            .field("broadcast_host", &self.broadcast_host)
            .field("broadcast_port", &self.broadcast_port)
            .field("save_results", &self.save_results)
            .field("results_file", &self.results_file)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Acknowledgment returned by `kill`.
#[derive(Debug, Clone, Serialize)]
pub struct KillConfirmation {
    /// Name of the killed client.
    pub name: String,
    /// Always true; killing a registered client cannot fail.
    pub killed: bool,
}

// =============================================================================
// Gateway
// =============================================================================

/// Registry and control surface for named streaming clients.
pub struct ConnectionGateway {
    clients: RwLock<HashMap<String, Arc<dyn StreamingClient>>>,
    factory: Arc<dyn ProviderFactory>,
    settings: ClientSettings,
}

impl ConnectionGateway {
    /// Create an empty gateway.
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, settings: ClientSettings) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
            settings,
        }
    }

    /// Build, connect, and register a new client.
    ///
    /// Fails when the name is taken by a client that is running or
    /// broadcasting; a fully stopped leftover under the same name is
    /// retired and replaced. Auth failures from the upstream feed
    /// propagate to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names, empty tokens, duplicate
    /// active clients, unknown providers, or a failed `connect`.
    pub async fn create_connection(
        &self,
        request: ConnectionRequest,
    ) -> Result<ClientStatus, GatewayError> {
        validate_name(&request.name)?;
        if request.auth_token.trim().is_empty() {
            return Err(GatewayError::EmptyToken);
        }

        if let Some(stale) = self.take_replaceable(&request.name)? {
            tracing::info!(client = %request.name, "Retiring stopped client before replacement");
            stale.kill().await;
        }

        let provider = self
            .factory
            .create(&ProviderRequest {
                provider: request.provider.clone(),
                asset_type: request.asset_type.clone(),
                feed: request.feed.clone(),
            })
            .map_err(map_provider_error)?;

        let client = Arc::new(
            FeedClient::new(
                request.name.clone(),
                AuthToken::new(request.auth_token.clone()),
                request.symbols.clone(),
                provider,
                self.settings.clone(),
                request.save_results,
                request.results_file.clone(),
            )
            .map_err(|e| op_failed(&request.name, "create", e))?,
        );

        if let Err(e) = client.connect().await {
            let mapped = op_failed(&request.name, "connect", e);
            client.kill().await;
            return Err(mapped);
        }

        if request.start_broadcast {
            let host = request
                .broadcast_host
                .clone()
                .unwrap_or_else(|| self.settings.broadcast_host.clone());
            let port = request.broadcast_port.unwrap_or(self.settings.broadcast_port);
            if let Err(e) = client.start_broadcasting(&host, port).await {
                let mapped = op_failed(&request.name, "start broadcasting", e);
                client.kill().await;
                return Err(mapped);
            }
        }

        // Publish, unless a concurrent create claimed the name first
        {
            let mut clients = self.clients.write();
            if clients.contains_key(&request.name) {
                drop(clients);
                client.kill().await;
                return Err(GatewayError::AlreadyExists(request.name));
            }
            clients.insert(request.name.clone(), Arc::clone(&client) as Arc<dyn StreamingClient>);
        }

        metrics::set_clients_active(self.client_count());
        tracing::info!(
            client = %request.name,
            provider = %request.provider,
            symbols = request.symbols.len(),
            broadcasting = request.start_broadcast,
            "Connection created"
        );
        Ok(client.status())
    }

    /// Add one symbol to a client's requested set.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, duplicate
    /// symbols, or a failed upstream call.
    pub async fn subscribe(
        &self,
        name: &str,
        symbol: &str,
        token: &str,
    ) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        client
            .subscribe_symbol(symbol)
            .await
            .map_err(|e| op_failed(name, "subscribe", e))?;
        tracing::info!(client = %name, symbol = %symbol, "Symbol subscribed");
        Ok(client.status())
    }

    /// Remove one symbol from a client's requested set.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, absent symbols,
    /// or a failed upstream call.
    pub async fn unsubscribe(
        &self,
        name: &str,
        symbol: &str,
        token: &str,
    ) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        client
            .unsubscribe_symbol(symbol)
            .await
            .map_err(|e| op_failed(name, "unsubscribe", e))?;
        tracing::info!(client = %name, symbol = %symbol, "Symbol unsubscribed");
        Ok(client.status())
    }

    /// Captured rows for a client, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::EmptyResult`] when nothing is captured,
    /// distinct from connection-level failures.
    pub async fn get_results(
        &self,
        name: &str,
        token: &str,
    ) -> Result<Vec<CaptureRecord>, GatewayError> {
        let client = self.authorized(name, token)?;
        client
            .results()
            .await
            .map_err(|e| op_failed(name, "get results", e))
    }

    /// Delete a client's captured rows, returning how many.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, or storage
    /// failures.
    pub async fn clear_results(&self, name: &str, token: &str) -> Result<u64, GatewayError> {
        let client = self.authorized(name, token)?;
        let cleared = client
            .clear_results()
            .await
            .map_err(|e| op_failed(name, "clear results", e))?;
        tracing::info!(client = %name, cleared, "Captured results cleared");
        Ok(cleared)
    }

    /// Stop a client's upstream session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, or an illegal
    /// lifecycle transition.
    pub async fn stop_connection(&self, name: &str, token: &str) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        client
            .disconnect()
            .await
            .map_err(|e| op_failed(name, "stop", e))?;
        tracing::info!(client = %name, "Connection stopped");
        Ok(client.status())
    }

    /// Stop (when running) and re-establish a client's upstream session.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, or a failed
    /// reconnect.
    pub async fn restart_connection(
        &self,
        name: &str,
        token: &str,
    ) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        if client.is_running() {
            client
                .disconnect()
                .await
                .map_err(|e| op_failed(name, "restart", e))?;
        }
        client
            .connect()
            .await
            .map_err(|e| op_failed(name, "restart", e))?;
        tracing::info!(client = %name, "Connection restarted");
        Ok(client.status())
    }

    /// Start a client's downstream broadcast server.
    ///
    /// Omitted host and port fall back to the gateway defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, an already
    /// running server, or a failed bind.
    pub async fn start_broadcasting(
        &self,
        name: &str,
        token: &str,
        host: Option<String>,
        port: Option<u16>,
    ) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        let host = host.unwrap_or_else(|| self.settings.broadcast_host.clone());
        let port = port.unwrap_or(self.settings.broadcast_port);
        let addr = client
            .start_broadcasting(&host, port)
            .await
            .map_err(|e| op_failed(name, "start broadcasting", e))?;
        tracing::info!(client = %name, addr = %addr, "Broadcasting started");
        Ok(client.status())
    }

    /// Stop a client's downstream broadcast server.
    ///
    /// A client that is neither running nor broadcasting afterwards has
    /// nothing left to do; it is retired from the registry and killed,
    /// and its final status is returned.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names, bad tokens, or when no
    /// server is running.
    pub async fn stop_broadcasting(
        &self,
        name: &str,
        token: &str,
    ) -> Result<ClientStatus, GatewayError> {
        let client = self.authorized(name, token)?;
        client
            .stop_broadcasting()
            .await
            .map_err(|e| op_failed(name, "stop broadcasting", e))?;

        if client.is_running() {
            return Ok(client.status());
        }

        let status = client.status();
        self.clients.write().remove(name);
        client.kill().await;
        metrics::set_clients_active(self.client_count());
        tracing::info!(client = %name, "Retired idle client after broadcast stop");
        Ok(status)
    }

    /// Kill a client and remove it from the registry.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names or bad tokens; the kill
    /// itself cannot fail.
    pub async fn kill(&self, name: &str, token: &str) -> Result<KillConfirmation, GatewayError> {
        let client = self.authorized(name, token)?;
        self.clients.write().remove(name);
        client.kill().await;
        metrics::set_clients_active(self.client_count());
        tracing::info!(client = %name, "Client killed and removed");
        Ok(KillConfirmation {
            name: name.to_string(),
            killed: true,
        })
    }

    /// Status snapshots for one client, or for every client when
    /// `name` is `"all"` (sorted by name).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NoClients`] when the registry is empty
    /// and [`GatewayError::NotFound`] for unknown names.
    pub fn get_client_status(&self, name: &str) -> Result<Vec<ClientStatus>, GatewayError> {
        let clients = self.clients.read();
        if clients.is_empty() {
            return Err(GatewayError::NoClients);
        }

        if name == ALL_CLIENTS {
            let mut statuses: Vec<ClientStatus> = clients.values().map(|c| c.status()).collect();
            statuses.sort_by(|a, b| a.name.cmp(&b.name));
            return Ok(statuses);
        }

        clients
            .get(name)
            .map(|client| vec![client.status()])
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }

    /// Status snapshots for every client, sorted by name. Empty when
    /// none are registered.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<ClientStatus> {
        let mut statuses: Vec<ClientStatus> =
            self.clients.read().values().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Downstream subscribers connected across every client.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.clients
            .read()
            .values()
            .map(|client| client.subscriber_count())
            .sum()
    }

    /// Kill every registered client. Used on process shutdown.
    pub async fn kill_all(&self) {
        let clients: Vec<(String, Arc<dyn StreamingClient>)> =
            self.clients.write().drain().collect();
        for (name, client) in clients {
            tracing::info!(client = %name, "Killing client on shutdown");
            client.kill().await;
        }
        metrics::set_clients_active(0);
    }

    fn authorized(&self, name: &str, token: &str) -> Result<Arc<dyn StreamingClient>, GatewayError> {
        let client = self
            .clients
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;

        if !client.verify_token(token) {
            tracing::warn!(client = %name, "Rejected operation with invalid auth token");
            return Err(GatewayError::AuthRejected(name.to_string()));
        }
        Ok(client)
    }

    /// Pull out a stopped leftover under `name`, or fail when the name
    /// is held by an active client.
    fn take_replaceable(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn StreamingClient>>, GatewayError> {
        let mut clients = self.clients.write();
        if let Some(existing) = clients.get(name)
            && (existing.is_running() || existing.broadcast_address().is_some())
        {
            return Err(GatewayError::AlreadyExists(name.to_string()));
        }
        Ok(clients.remove(name))
    }
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGateway")
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<(), GatewayError> {
    let well_formed = !name.is_empty()
        && name != ALL_CLIENTS
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if well_formed {
        Ok(())
    } else {
        Err(GatewayError::InvalidName(name.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::client::MockStreamingClient;
    use crate::infrastructure::upstream::UpstreamProvider;

    struct NullFactory;

    impl ProviderFactory for NullFactory {
        fn create(
            &self,
            request: &ProviderRequest,
        ) -> Result<Arc<dyn UpstreamProvider>, ProviderError> {
            Err(ProviderError::UnknownProvider(request.provider.clone()))
        }
    }

    fn gateway() -> ConnectionGateway {
        ConnectionGateway::new(Arc::new(NullFactory), ClientSettings::default())
    }

    fn status_of(name: &str, is_running: bool) -> ClientStatus {
        ClientStatus {
            name: name.to_string(),
            is_running,
            is_broadcasting: false,
            broadcast_address: String::new(),
            symbol: String::new(),
            last_error: None,
        }
    }

    fn request(name: &str) -> ConnectionRequest {
        ConnectionRequest {
            name: name.to_string(),
            provider: "polygon".to_string(),
            auth_token: "secret".to_string(),
            ..ConnectionRequest::default()
        }
    }

    fn register(gateway: &ConnectionGateway, name: &str, mock: MockStreamingClient) {
        gateway
            .clients
            .write()
            .insert(name.to_string(), Arc::new(mock));
    }

    #[tokio::test]
    async fn operations_on_unknown_client_are_not_found() {
        let gateway = gateway();

        let err = gateway.subscribe("ghost", "BTCUSD", "secret").await.unwrap_err();

        assert!(matches!(err, GatewayError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(false);
        register(&gateway, "c1", mock);

        let err = gateway.subscribe("c1", "BTCUSD", "wrong").await.unwrap_err();

        assert!(matches!(err, GatewayError::AuthRejected(name) if name == "c1"));
    }

    #[tokio::test]
    async fn subscribe_delegates_and_returns_status() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(true);
        mock.expect_subscribe_symbol()
            .withf(|symbol| symbol == "ETHUSD")
            .returning(|_| Ok(()));
        mock.expect_status().returning(|| status_of("c1", true));
        register(&gateway, "c1", mock);

        let status = gateway.subscribe("c1", "ETHUSD", "secret").await.unwrap();

        assert_eq!(status.name, "c1");
        assert!(status.is_running);
    }

    #[tokio::test]
    async fn duplicate_subscription_maps_to_already_subscribed() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(true);
        mock.expect_subscribe_symbol()
            .returning(|symbol| Err(ClientError::AlreadySubscribed(symbol.to_string())));
        register(&gateway, "c1", mock);

        let err = gateway.subscribe("c1", "BTCUSD", "secret").await.unwrap_err();

        assert!(matches!(
            err,
            GatewayError::AlreadySubscribed { name, symbol } if name == "c1" && symbol == "BTCUSD"
        ));
    }

    #[tokio::test]
    async fn create_rejects_empty_token() {
        let gateway = gateway();
        let mut req = request("c1");
        req.auth_token = "   ".to_string();

        let err = gateway.create_connection(req).await.unwrap_err();

        assert!(matches!(err, GatewayError::EmptyToken));
    }

    #[tokio::test]
    async fn create_rejects_reserved_and_malformed_names() {
        let gateway = gateway();

        for name in ["all", "", "bad name", "../escape"] {
            let err = gateway.create_connection(request(name)).await.unwrap_err();
            assert!(matches!(err, GatewayError::InvalidName(_)), "name: {name}");
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_active_client() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_is_running().return_const(true);
        register(&gateway, "c1", mock);

        let err = gateway.create_connection(request("c1")).await.unwrap_err();

        assert!(matches!(err, GatewayError::AlreadyExists(name) if name == "c1"));
    }

    #[tokio::test]
    async fn create_surfaces_unknown_provider() {
        let gateway = gateway();

        let err = gateway.create_connection(request("c1")).await.unwrap_err();

        assert!(matches!(err, GatewayError::UnknownProvider(p) if p == "polygon"));
    }

    #[tokio::test]
    async fn status_with_empty_registry_fails() {
        let gateway = gateway();

        let err = gateway.get_client_status("all").unwrap_err();

        assert!(matches!(err, GatewayError::NoClients));
    }

    #[tokio::test]
    async fn status_all_is_sorted_by_name() {
        let gateway = gateway();
        let mut zeta = MockStreamingClient::new();
        zeta.expect_status().returning(|| status_of("zeta", true));
        let mut alpha = MockStreamingClient::new();
        alpha.expect_status().returning(|| status_of("alpha", false));
        register(&gateway, "zeta", zeta);
        register(&gateway, "alpha", alpha);

        let statuses = gateway.get_client_status("all").unwrap();

        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn kill_removes_client_and_second_kill_fails() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(true);
        mock.expect_kill().times(1).return_const(());
        register(&gateway, "c1", mock);

        let confirmation = gateway.kill("c1", "secret").await.unwrap();
        assert_eq!(confirmation.name, "c1");
        assert!(confirmation.killed);

        let err = gateway.kill("c1", "secret").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(name) if name == "c1"));
    }

    #[tokio::test]
    async fn stop_broadcasting_retires_fully_stopped_client() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(true);
        mock.expect_stop_broadcasting().returning(|| Ok(()));
        mock.expect_is_running().return_const(false);
        mock.expect_status().returning(|| status_of("c1", false));
        mock.expect_kill().times(1).return_const(());
        register(&gateway, "c1", mock);

        let status = gateway.stop_broadcasting("c1", "secret").await.unwrap();

        assert!(!status.is_running);
        assert_eq!(gateway.client_count(), 0);
    }

    #[tokio::test]
    async fn stop_broadcasting_without_server_maps_to_not_broadcasting() {
        let gateway = gateway();
        let mut mock = MockStreamingClient::new();
        mock.expect_verify_token().return_const(true);
        mock.expect_stop_broadcasting()
            .returning(|| Err(ClientError::Broadcast(BroadcastError::NotRunning)));
        register(&gateway, "c1", mock);

        let err = gateway.stop_broadcasting("c1", "secret").await.unwrap_err();

        assert!(matches!(err, GatewayError::NotBroadcasting(name) if name == "c1"));
    }
}
