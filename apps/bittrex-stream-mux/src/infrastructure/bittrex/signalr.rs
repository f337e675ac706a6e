//! SignalR Hub Client
//!
//! Transport adapter implementing the [`HubConnector`] / [`HubConnection`]
//! ports against the Bittrex SignalR 1.x endpoint.
//!
//! # Protocol
//!
//! 1. HTTP `GET /negotiate?clientProtocol=1.5&connectionData=...` returns a
//!    connection token (the request must carry the bypass credential's
//!    user-agent and cookie headers or the gateway answers 503).
//! 2. WebSocket `/connect?transport=webSockets&connectionToken=...` opens the
//!    persistent connection; the first frame carries `S: 1`.
//! 3. Hub calls are JSON invocations correlated by invocation id; pushed
//!    `updateExchangeState` messages carry order book deltas.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::messages::{HubInvocation, NegotiateResponse, PersistentFrame};
use crate::application::ports::{
    BypassCredential, ConnectionEvent, HubConnection, HubConnector, TransportError,
};
use crate::domain::market::{BookSnapshot, MarketKey};

/// Hub push method carrying order book deltas.
const UPDATE_EXCHANGE_STATE: &str = "updateExchangeState";

/// Hub method declaring subscription intent.
const SUBSCRIBE_TO_DELTAS: &str = "SubscribeToExchangeDeltas";

/// Hub method querying the full book snapshot.
const QUERY_EXCHANGE_STATE: &str = "QueryExchangeState";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the SignalR transport.
#[derive(Debug, Clone)]
pub struct SignalRConfig {
    /// Base HTTPS endpoint, e.g. `https://socket.bittrex.com/signalr`.
    pub base_url: Url,
    /// Hub name used for invocations.
    pub hub: String,
    /// Timeout for one hub invocation round-trip.
    pub call_timeout: Duration,
    /// Event channel capacity per connection.
    pub event_capacity: usize,
}

impl SignalRConfig {
    /// Configuration for the Bittrex production hub.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the endpoint string
    /// is not a valid URL.
    pub fn bittrex(endpoint: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(endpoint)
            .map_err(|e| TransportError::ConnectionFailed(format!("bad endpoint: {e}")))?;
        Ok(Self {
            base_url,
            hub: "corehub".to_string(),
            call_timeout: Duration::from_secs(30),
            event_capacity: 1024,
        })
    }

    fn connection_data(&self) -> String {
        format!(r#"[{{"name":"{}"}}]"#, self.hub)
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Factory for SignalR hub connections.
pub struct SignalRConnector {
    config: SignalRConfig,
    http: reqwest::Client,
}

impl SignalRConnector {
    /// Create a connector.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionFailed`] if the HTTP client
    /// cannot be constructed.
    pub fn new(config: SignalRConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::ConnectionFailed(format!("http client: {e}")))?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl HubConnector for SignalRConnector {
    async fn open(
        &self,
        credential: &BypassCredential,
    ) -> Result<(Arc<dyn HubConnection>, mpsc::Receiver<ConnectionEvent>), TransportError> {
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);
        let connection = Arc::new(SignalRConnection {
            config: self.config.clone(),
            http: self.http.clone(),
            credential: RwLock::new(credential.clone()),
            event_tx,
            active: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_invocation: AtomicU64::new(0),
            attempts: Arc::new(AtomicU32::new(0)),
        });
        Ok((connection, event_rx))
    }
}

// =============================================================================
// Connection
// =============================================================================

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<PersistentFrame>>>>;

struct ActiveSocket {
    writer_tx: mpsc::Sender<Message>,
    io_cancel: CancellationToken,
}

/// One persistent SignalR connection.
pub struct SignalRConnection {
    config: SignalRConfig,
    http: reqwest::Client,
    credential: RwLock<BypassCredential>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    active: Mutex<Option<ActiveSocket>>,
    pending: PendingCalls,
    next_invocation: AtomicU64,
    attempts: Arc<AtomicU32>,
}

impl SignalRConnection {
    /// Perform the negotiate HTTP call.
    async fn negotiate(&self) -> Result<NegotiateResponse, TransportError> {
        let mut url = self.config.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::ConnectionFailed("endpoint cannot be a base".to_string()))?
            .push("negotiate");
        url.query_pairs_mut()
            .append_pair("clientProtocol", "1.5")
            .append_pair("connectionData", &self.config.connection_data());

        let credential = self.credential.read().clone();
        let response = self
            .http
            .get(url)
            .header(reqwest::header::USER_AGENT, credential.user_agent())
            .header(reqwest::header::COOKIE, credential.cookie())
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("negotiate: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
            });
        }

        response
            .json::<NegotiateResponse>()
            .await
            .map_err(|e| TransportError::Protocol(format!("negotiate body: {e}")))
    }

    /// Build the websocket connect URL for a negotiated token.
    fn connect_url(&self, token: &str) -> Result<Url, TransportError> {
        let mut url = self.config.base_url.clone();
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|()| TransportError::ConnectionFailed("endpoint scheme".to_string()))?;
        url.path_segments_mut()
            .map_err(|()| TransportError::ConnectionFailed("endpoint cannot be a base".to_string()))?
            .push("connect");
        url.query_pairs_mut()
            .append_pair("transport", "webSockets")
            .append_pair("clientProtocol", "1.5")
            .append_pair("connectionToken", token)
            .append_pair("connectionData", &self.config.connection_data());
        Ok(url)
    }

    /// Issue one hub invocation and await its result frame.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, TransportError> {
        let writer_tx = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.writer_tx.clone())
            .ok_or(TransportError::Closed)?;

        let id = self.next_invocation.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let call = HubInvocation {
            hub: self.config.hub.clone(),
            method: method.to_string(),
            args,
            invocation_id: id,
        };
        let json = serde_json::to_string(&call)
            .map_err(|e| TransportError::Protocol(format!("serialize call: {e}")))?;

        if writer_tx.send(Message::Text(json.into())).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        let frame = match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(TransportError::Call(format!("{method} timed out")));
            }
        };

        if let Some(error) = frame.error {
            return Err(TransportError::Call(error));
        }
        Ok(frame.result.unwrap_or(Value::Null))
    }

    fn emit(&self, event: ConnectionEvent) {
        // Sent from the io task or lifecycle paths; a full channel means the
        // shard loop is hopelessly behind, so drop rather than block the read.
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::warn!(error = %e, "Dropping connection event");
        }
    }

    /// Fail every outstanding invocation after the socket went away.
    fn fail_pending(pending: &PendingCalls) {
        let calls = std::mem::take(&mut *pending.lock());
        for (_, tx) in calls {
            drop(tx);
        }
    }
}

#[async_trait]
impl HubConnection for SignalRConnection {
    async fn start(&self) -> Result<(), TransportError> {
        // Restarting an active connection tears the old socket down first.
        self.stop().await;

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            self.emit(ConnectionEvent::Reconnecting { attempt });
        }

        let negotiate = self.negotiate().await?;
        let url = self.connect_url(&negotiate.connection_token)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(format!("ws request: {e}")))?;
        {
            let credential = self.credential.read().clone();
            let headers = request.headers_mut();
            headers.insert(
                "User-Agent",
                credential
                    .user_agent()
                    .parse()
                    .map_err(|_| TransportError::ConnectionFailed("bad user-agent".to_string()))?,
            );
            headers.insert(
                "Cookie",
                credential
                    .cookie()
                    .parse()
                    .map_err(|_| TransportError::ConnectionFailed("bad cookie".to_string()))?,
            );
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tokio_tungstenite::tungstenite::Error::Http(response) => TransportError::Rejected {
                    status: response.status().as_u16(),
                },
                other => TransportError::ConnectionFailed(other.to_string()),
            })?;

        tracing::debug!(connection = ?negotiate.connection_id, "SignalR socket open");

        let (writer_tx, writer_rx) = mpsc::channel(64);
        let io_cancel = CancellationToken::new();
        *self.active.lock() = Some(ActiveSocket {
            writer_tx,
            io_cancel: io_cancel.clone(),
        });

        tokio::spawn(run_io(
            ws_stream,
            writer_rx,
            io_cancel,
            self.event_tx.clone(),
            Arc::clone(&self.pending),
            Arc::clone(&self.attempts),
        ));

        Ok(())
    }

    async fn stop(&self) {
        if let Some(active) = self.active.lock().take() {
            active.io_cancel.cancel();
        }
        Self::fail_pending(&self.pending);
    }

    fn apply_credential(&self, credential: &BypassCredential) {
        *self.credential.write() = credential.clone();
    }

    async fn subscribe_deltas(&self, key: &MarketKey) -> Result<bool, TransportError> {
        let result = self
            .invoke(SUBSCRIBE_TO_DELTAS, vec![Value::String(key.as_str().to_string())])
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn query_state(&self, key: &MarketKey) -> Result<BookSnapshot, TransportError> {
        let result = self
            .invoke(QUERY_EXCHANGE_STATE, vec![Value::String(key.as_str().to_string())])
            .await?;
        if result.is_null() {
            return Err(TransportError::Call(format!("empty snapshot for {key}")));
        }
        serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("snapshot for {key}: {e}")))
    }
}

// =============================================================================
// IO Task
// =============================================================================

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Pump one websocket until it closes, errors, or is cancelled.
async fn run_io(
    ws_stream: WsStream,
    mut writer_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    event_tx: mpsc::Sender<ConnectionEvent>,
    pending: PendingCalls,
    attempts: Arc<AtomicU32>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            outbound = writer_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(error) = write.send(message).await {
                            tracing::warn!(%error, "SignalR write failed");
                            let _ = event_tx.try_send(ConnectionEvent::Fault {
                                status: None,
                                message: error.to_string(),
                            });
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&text, &event_tx, &pending, &attempts);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if !cancel.is_cancelled() {
                            let _ = event_tx.try_send(ConnectionEvent::Disconnected);
                        }
                        break;
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames are not part of the protocol.
                    }
                    Some(Err(error)) => {
                        if !cancel.is_cancelled() {
                            let status = match &error {
                                tokio_tungstenite::tungstenite::Error::Http(response) => {
                                    Some(response.status().as_u16())
                                }
                                _ => None,
                            };
                            let _ = event_tx.try_send(ConnectionEvent::Fault {
                                status,
                                message: error.to_string(),
                            });
                        }
                        break;
                    }
                }
            }
        }
    }

    let calls = std::mem::take(&mut *pending.lock());
    drop(calls);
    tracing::debug!("SignalR io task stopped");
}

/// Dispatch one inbound frame: init, call result, or hub push.
fn handle_frame(
    text: &str,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    pending: &PendingCalls,
    attempts: &AtomicU32,
) {
    let frame: PersistentFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(%error, "Unparseable SignalR frame");
            return;
        }
    };

    if frame.is_init() {
        attempts.store(0, Ordering::SeqCst);
        let _ = event_tx.try_send(ConnectionEvent::Connected);
    }

    if frame.is_call_result() {
        if let Some(id) = frame.call_id() {
            if let Some(tx) = pending.lock().remove(&id) {
                let _ = tx.send(frame.clone());
            } else {
                tracing::debug!(id, "Result for unknown invocation");
            }
        }
    }

    for message in &frame.messages {
        if message.method.eq_ignore_ascii_case(UPDATE_EXCHANGE_STATE) {
            let Some(payload) = message.args.first() else {
                continue;
            };
            match serde_json::from_value(payload.clone()) {
                Ok(delta) => {
                    let _ = event_tx.try_send(ConnectionEvent::Push(delta));
                }
                Err(error) => {
                    tracing::warn!(%error, "Unparseable exchange state delta");
                }
            }
        } else {
            tracing::trace!(method = %message.method, "Ignoring hub message");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SignalRConfig {
        SignalRConfig::bittrex("https://socket.bittrex.com/signalr").unwrap()
    }

    #[test]
    fn bittrex_config_defaults() {
        let config = config();
        assert_eq!(config.hub, "corehub");
        assert_eq!(config.connection_data(), r#"[{"name":"corehub"}]"#);
    }

    #[test]
    fn bad_endpoint_rejected() {
        assert!(SignalRConfig::bittrex("not a url").is_err());
    }

    fn connection() -> SignalRConnection {
        let (event_tx, _event_rx) = mpsc::channel(4);
        SignalRConnection {
            config: config(),
            http: reqwest::Client::new(),
            credential: RwLock::new(BypassCredential::new("agent", "cookie")),
            event_tx,
            active: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_invocation: AtomicU64::new(0),
            attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    #[tokio::test]
    async fn open_yields_idle_connection() {
        let connector = SignalRConnector::new(config()).unwrap();
        let credential = BypassCredential::new("agent", "cf=token");
        let (connection, mut events) = connector.open(&credential).await.unwrap();

        // Not started: invocations fail with Closed and no events are emitted.
        let key: MarketKey = "BTC-ETH".parse().unwrap();
        assert!(matches!(
            connection.subscribe_deltas(&key).await,
            Err(TransportError::Closed)
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn connect_url_shape() {
        let url = connection().connect_url("tok+en==").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert!(url.path().ends_with("/connect"));
        let query = url.query().unwrap();
        assert!(query.contains("transport=webSockets"));
        assert!(query.contains("connectionToken=tok%2Ben%3D%3D"));
    }

    #[test]
    fn init_frame_emits_connected_and_resets_attempts() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let attempts = AtomicU32::new(5);

        handle_frame(r#"{"C":"d-1","S":1,"M":[]}"#, &event_tx, &pending, &attempts);

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert!(matches!(
            event_rx.try_recv(),
            Ok(ConnectionEvent::Connected)
        ));
    }

    #[test]
    fn result_frame_resolves_pending_call() {
        let (event_tx, _event_rx) = mpsc::channel(4);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let attempts = AtomicU32::new(0);

        let (tx, mut rx) = oneshot::channel();
        pending.lock().insert(4, tx);

        handle_frame(r#"{"R":true,"I":"4"}"#, &event_tx, &pending, &attempts);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.result, Some(Value::Bool(true)));
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn push_frame_emits_delta() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let attempts = AtomicU32::new(0);

        let text = r#"{
            "M": [{
                "H": "CoreHub",
                "M": "updateExchangeState",
                "A": [{"MarketName": "BTC-ETH", "Nonce": 9, "Buys": [], "Sells": [], "Fills": []}]
            }]
        }"#;
        handle_frame(text, &event_tx, &pending, &attempts);

        match event_rx.try_recv() {
            Ok(ConnectionEvent::Push(delta)) => assert_eq!(delta.nonce, 9),
            other => panic!("expected push event, got {other:?}"),
        }
    }

    #[test]
    fn garbage_frame_is_dropped() {
        let (event_tx, mut event_rx) = mpsc::channel(4);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let attempts = AtomicU32::new(0);

        handle_frame("not json", &event_tx, &pending, &attempts);
        assert!(event_rx.try_recv().is_err());
    }
}
