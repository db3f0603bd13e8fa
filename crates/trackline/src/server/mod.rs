//! Ingestion server.
//!
//! Routes:
//!
//! - `POST /telemetry` authenticates the device, stores the record and
//!   publishes it when it is live
//! - `GET /ws` upgrades to the realtime channel
//! - `GET /ping` liveness probe

pub mod auth;
pub mod fanout;
pub mod ingest;
pub mod store;

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::wire::{ConnectedGreeting, IngestRequest, IngestResponse, RealtimeEvent};

pub use auth::{AuthError, CredentialIssuer, CredentialVerifier, DeviceClaims};
pub use fanout::RealtimeFanout;
pub use ingest::{IngestError, IngestionEndpoint};
pub use store::{InsertOutcome, StoredRecord, TelemetryStore};

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::Storage(e) => {
                error!("Failed to store record: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            Self::Storage(_) => "Failed to store record".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "message": message }))).into_response()
    }
}

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    endpoint: Arc<IngestionEndpoint>,
    verifier: Arc<CredentialVerifier>,
}

impl AppState {
    /// Create handler state.
    #[must_use]
    pub fn new(endpoint: IngestionEndpoint, verifier: CredentialVerifier) -> Self {
        Self {
            endpoint: Arc::new(endpoint),
            verifier: Arc::new(verifier),
        }
    }

    /// The ingestion endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &IngestionEndpoint {
        &self.endpoint
    }
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/telemetry", post(ingest_handler))
        .route("/ws", get(ws_handler))
        .route("/ping", get(ping))
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn ingest_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<IngestRequest>, JsonRejection>,
) -> std::result::Result<Json<IngestResponse>, IngestError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let device_id = state.verifier.authenticate(auth).map_err(|e| {
        debug!("Rejected unauthenticated request: {}", e);
        e
    })?;

    let Json(request) =
        payload.map_err(|rejection| IngestError::MalformedPayload(rejection.body_text()))?;

    let endpoint = Arc::clone(&state.endpoint);
    let response = tokio::task::spawn_blocking(move || endpoint.ingest(&device_id, request))
        .await
        .map_err(|e| IngestError::Storage(Error::internal(format!("ingest task failed: {e}"))))??;

    Ok(Json(response))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.endpoint.fanout().subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

async fn handle_socket(socket: WebSocket, mut events: broadcast::Receiver<RealtimeEvent>) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    let greeting = RealtimeEvent::Connected(ConnectedGreeting {
        connection_id,
        connected_at: Utc::now(),
    });
    if let Ok(json) = serde_json::to_string(&greeting) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }
    debug!(%connection_id, "Realtime subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else { continue };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%connection_id, skipped, "Realtime subscriber lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(%connection_id, "Realtime subscriber disconnected");
}

/// The assembled server.
#[derive(Debug, Clone)]
pub struct TelemetryServer {
    state: AppState,
}

impl TelemetryServer {
    /// Assemble a server from its parts.
    #[must_use]
    pub fn new(store: Arc<TelemetryStore>, verifier: CredentialVerifier, capacity: usize) -> Self {
        let endpoint = IngestionEndpoint::new(store, RealtimeFanout::new(capacity));
        Self {
            state: AppState::new(endpoint, verifier),
        }
    }

    /// Assemble a server from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is missing or the store cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self> {
        let verifier = CredentialVerifier::new(config.token_secret()?);
        let store = Arc::new(TelemetryStore::open(config.database_path())?);
        Ok(Self::new(store, verifier, config.server.broadcast_capacity))
    }

    /// Handler state.
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router.
    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Bind a listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Telemetry server listening on {}", addr);
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Telemetry server stopped");
        Ok(())
    }
}

/// Resolve when the process receives Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::wire::RealtimeUpdate;

    const SECRET: &str = "server-test-secret";

    struct TestServer {
        addr: SocketAddr,
        store: Arc<TelemetryStore>,
        _shutdown: tokio::sync::oneshot::Sender<()>,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }
    }

    async fn spawn_server() -> TestServer {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let server = TelemetryServer::new(Arc::clone(&store), CredentialVerifier::new(SECRET), 16);
        let listener = TelemetryServer::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(server.serve(listener, async {
            let _ = rx.await;
        }));

        TestServer {
            addr,
            store,
            _shutdown: tx,
        }
    }

    fn token(device_id: &str) -> String {
        CredentialIssuer::new(SECRET)
            .issue(device_id, Some("alice"), Some("van"), chrono::Duration::hours(1))
            .unwrap()
    }

    fn body(is_offline: bool) -> serde_json::Value {
        json!({
            "latitude": 10.77,
            "longitude": 106.69,
            "userName": "alice",
            "title": "van",
            "recordTimestamp": Utc::now().to_rfc3339(),
            "isOffline": is_offline,
            "clientRecordId": Uuid::now_v7(),
        })
    }

    type WsStream =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn next_event(ws: &mut WsStream) -> Option<RealtimeEvent> {
        loop {
            let frame = tokio::time::timeout(Duration::from_millis(500), ws.next())
                .await
                .ok()??
                .ok()?;
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).ok();
            }
        }
    }

    async fn subscribe(server: &TestServer) -> WsStream {
        let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut ws).await,
            Some(RealtimeEvent::Connected(_))
        ));
        ws
    }

    #[tokio::test]
    async fn test_ping() {
        let server = spawn_server().await;
        let response = reqwest::get(server.url("/ping")).await.unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_missing_credential_is_401() {
        let server = spawn_server().await;
        let response = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .json(&body(false))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(server.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_credential_is_401() {
        let server = spawn_server().await;
        let forged = CredentialIssuer::new("wrong-secret")
            .issue("dev-1", None, None, chrono::Duration::hours(1))
            .unwrap();

        let response = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .bearer_auth(forged)
            .json(&body(false))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(server.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_latitude_is_400() {
        let server = spawn_server().await;
        let response = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .bearer_auth(token("dev-1"))
            .json(&json!({ "longitude": 106.69, "isOffline": false }))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert!(body["message"].as_str().unwrap().contains("malformed"));
        assert_eq!(server.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_live_record_reaches_subscriber() {
        let server = spawn_server().await;
        let mut ws = subscribe(&server).await;

        let response: IngestResponse = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .bearer_auth(token("dev-7"))
            .json(&body(false))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response.message, ingest::MSG_REALTIME);
        match next_event(&mut ws).await {
            Some(RealtimeEvent::LocationUpdate(RealtimeUpdate {
                device_id,
                user_name,
                ..
            })) => {
                assert_eq!(device_id, "dev-7");
                assert_eq!(user_name, "alice");
            }
            other => panic!("expected location update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offline_record_stored_not_broadcast() {
        let server = spawn_server().await;
        let mut ws = subscribe(&server).await;

        let response: IngestResponse = reqwest::Client::new()
            .post(server.url("/telemetry"))
            .bearer_auth(token("dev-7"))
            .json(&body(true))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(response.message, ingest::MSG_OFFLINE);
        assert_eq!(server.store.count().unwrap(), 1);
        assert!(next_event(&mut ws).await.is_none());
    }

    #[tokio::test]
    async fn test_device_transport_against_server() {
        use crate::device::{HttpTransport, TelemetryTransport};
        use crate::record::{DeviceIdentity, PositionFix, TelemetryRecord};

        let server = spawn_server().await;
        let transport =
            HttpTransport::new(&server.url(""), Duration::from_secs(5)).unwrap();
        let identity = DeviceIdentity {
            device_id: "ignored-by-server".to_string(),
            user_name: "alice".to_string(),
            title: "van".to_string(),
        };
        let record = TelemetryRecord::from_fix(&identity, &PositionFix::new(1.0, 2.0, 3.0), true);

        let first = transport.send(&record, &token("dev-9")).await.unwrap();
        let again = transport.send(&record, &token("dev-9")).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(server.store.count().unwrap(), 1);
        let stored = server.store.records_for_device("dev-9", 10).unwrap();
        assert_eq!(stored[0].client_record_id, Some(record.id));
    }

    #[tokio::test]
    async fn test_rejected_status_surfaces_to_transport() {
        use crate::device::{DeliveryError, HttpTransport, TelemetryTransport};
        use crate::record::{DeviceIdentity, PositionFix, TelemetryRecord};

        let server = spawn_server().await;
        let transport = HttpTransport::new(&server.url(""), Duration::from_secs(5)).unwrap();
        let identity = DeviceIdentity {
            device_id: "dev-1".to_string(),
            user_name: "alice".to_string(),
            title: "van".to_string(),
        };
        let record = TelemetryRecord::from_fix(&identity, &PositionFix::new(1.0, 2.0, 3.0), false);

        let err = transport.send(&record, "garbage").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 401, .. }));
    }
}
