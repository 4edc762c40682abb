//! # Relay Server
//!
//! Hosts a shared remote tree over WebSocket so devices on different
//! machines can sync through it.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Relay Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                      RelayServer (Axum)                         │   │
//! │  │                                                                 │   │
//! │  │  /ws endpoint ──▶ WebSocket upgrade                            │   │
//! │  │  /health      ──▶ { status, protocolVersion, connections }     │   │
//! │  │                        │                                        │   │
//! │  │                        ▼                                        │   │
//! │  │              ┌─────────────────┐                                │   │
//! │  │              │ per-connection  │  write/read ──► MemoryRemote   │   │
//! │  │              │ handler         │  subscribe  ──► listener whose │   │
//! │  │              └─────────────────┘     handler emits Event frames │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  A closed connection drops all of its listeners.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{RelayMessage, PROTOCOL_VERSION};
use crate::remote::{MemoryRemote, RemoteEvent, RemoteHandler, RemoteQuery, RemoteStore, Subscription};

// =============================================================================
// Constants
// =============================================================================

/// Default port for the relay.
pub const DEFAULT_RELAY_PORT: u16 = 8787;

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum message size (4MB).
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

// =============================================================================
// Relay Configuration
// =============================================================================

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port to listen on (0 picks a free port).
    pub port: u16,
    /// Bind address.
    pub bind_addr: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            port: DEFAULT_RELAY_PORT,
            bind_addr: "0.0.0.0".to_string(),
        }
    }
}

impl RelayConfig {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Relay State
// =============================================================================

struct RelayState {
    tree: MemoryRemote,
    connections: AtomicUsize,
}

// =============================================================================
// Relay Server
// =============================================================================

/// WebSocket server over a [`MemoryRemote`] tree.
pub struct RelayServer {
    config: RelayConfig,
    state: Arc<RelayState>,
}

/// Handle for controlling a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<RelayState>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl RelayHandle {
    /// Address the relay is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// The hosted tree.
    pub fn tree(&self) -> &MemoryRemote {
        &self.state.tree
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Shuts down the relay.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Relay shutdown channel closed".into()))
    }
}

impl RelayServer {
    /// Creates a relay over an empty tree.
    pub fn new(config: RelayConfig) -> Self {
        RelayServer::with_tree(config, MemoryRemote::new())
    }

    /// Creates a relay over an existing tree.
    pub fn with_tree(config: RelayConfig, tree: MemoryRemote) -> Self {
        RelayServer {
            config,
            state: Arc::new(RelayState {
                tree,
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Binds and starts serving in the background.
    pub async fn start(self) -> SyncResult<RelayHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        info!(addr = %local_addr, "Relay started");

        tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_rx.recv().await;
                info!("Relay shutting down");
            })
            .await;
            if let Err(e) = served {
                warn!(error = %e, "Relay server error");
            }
        });

        Ok(RelayHandle {
            state: self.state,
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "protocolVersion": PROTOCOL_VERSION,
        "connections": state.connections.load(Ordering::SeqCst),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    info!(addr = %addr, "New WebSocket connection");
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    state.connections.fetch_add(1, Ordering::SeqCst);

    // Listener handlers are synchronous, so frames go through an unbounded queue.
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let ping_tx = outgoing_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        loop {
            ping_interval.tick().await;
            if ping_tx.send(Message::Ping(axum::body::Bytes::new())).is_err() {
                break;
            }
        }
    });

    let mut connection = RelayConnection {
        state: state.clone(),
        addr,
        outgoing_tx,
        subscriptions: HashMap::new(),
    };

    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match RelayMessage::from_json(text.as_str()) {
                Ok(msg) => connection.handle(msg).await,
                Err(e) => debug!(addr = %addr, error = %e, "Invalid frame"),
            },
            Some(Ok(Message::Binary(data))) => match serde_json::from_slice::<RelayMessage>(&data) {
                Ok(msg) => connection.handle(msg).await,
                Err(e) => debug!(addr = %addr, error = %e, "Invalid binary frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = connection.outgoing_tx.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                info!(addr = %addr, "Client requested close");
                break;
            }
            Some(Err(e)) => {
                warn!(addr = %addr, error = %e, "WebSocket error");
                break;
            }
            None => {
                info!(addr = %addr, "Client disconnected");
                break;
            }
        }
    }

    let listeners = connection.subscriptions.len();
    drop(connection);
    ping_handle.abort();
    outgoing_handle.abort();
    state.connections.fetch_sub(1, Ordering::SeqCst);
    debug!(addr = %addr, listeners, "Connection cleaned up");
}

/// Per-connection request handling.
struct RelayConnection {
    state: Arc<RelayState>,
    addr: SocketAddr,
    outgoing_tx: mpsc::UnboundedSender<Message>,
    subscriptions: HashMap<u64, Subscription>,
}

impl RelayConnection {
    fn reply(&self, msg: RelayMessage) {
        send_frame(&self.outgoing_tx, &msg);
    }

    async fn handle(&mut self, msg: RelayMessage) {
        debug!(addr = %self.addr, msg_type = %msg.type_name(), "Received frame");

        match msg {
            RelayMessage::Write {
                request_id,
                path,
                value,
            } => match self.state.tree.write(&path, value).await {
                Ok(()) => self.reply(RelayMessage::Ack { request_id }),
                Err(e) => self.reply(RelayMessage::request_error(request_id, e.to_string())),
            },

            RelayMessage::Read { request_id, path } => match self.state.tree.read(&path).await {
                Ok(value) => self.reply(RelayMessage::ReadResult { request_id, value }),
                Err(e) => self.reply(RelayMessage::request_error(request_id, e.to_string())),
            },

            RelayMessage::Subscribe {
                subscription_id,
                path,
                start_at,
            } => {
                // A resubscribe after reconnect reuses the id.
                self.subscriptions.remove(&subscription_id);

                let tx = self.outgoing_tx.clone();
                let handler: RemoteHandler = Arc::new(move |event| {
                    let frame = match event {
                        RemoteEvent::Value(value) => RelayMessage::Event {
                            subscription_id,
                            value,
                        },
                        RemoteEvent::Error(message) => {
                            RelayMessage::subscription_error(subscription_id, message)
                        }
                    };
                    send_frame(&tx, &frame);
                });

                match self
                    .state
                    .tree
                    .subscribe(&path, RemoteQuery { start_at }, handler)
                    .await
                {
                    Ok(subscription) => {
                        self.subscriptions.insert(subscription_id, subscription);
                    }
                    Err(e) => {
                        self.reply(RelayMessage::subscription_error(subscription_id, e.to_string()))
                    }
                }
            }

            RelayMessage::Unsubscribe { subscription_id } => {
                if self.subscriptions.remove(&subscription_id).is_none() {
                    debug!(subscription_id, "Unsubscribe for unknown listener");
                }
            }

            other => {
                warn!(addr = %self.addr, msg_type = %other.type_name(), "Unexpected frame from client");
            }
        }
    }
}

fn send_frame(tx: &mpsc::UnboundedSender<Message>, msg: &RelayMessage) {
    match msg.to_json() {
        Ok(json) => {
            if tx.send(Message::Text(json.into())).is_err() {
                debug!("Connection closed, frame dropped");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{WsRemote, WsRemoteConfig};
    use serde_json::Value;
    use std::sync::Mutex;

    async fn start_relay() -> RelayHandle {
        RelayServer::new(RelayConfig {
            port: 0,
            bind_addr: "127.0.0.1".into(),
        })
        .start()
        .await
        .unwrap()
    }

    async fn client(relay: &RelayHandle) -> WsRemote {
        let remote = WsRemote::spawn(WsRemoteConfig {
            url: relay.ws_url(),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        remote.wait_connected(Duration::from_secs(5)).await.unwrap();
        remote
    }

    fn recorder() -> (RemoteHandler, Arc<Mutex<Vec<RemoteEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: RemoteHandler = Arc::new(move |event| sink.lock().unwrap().push(event));
        (handler, events)
    }

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..250 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_relay_config_bind_address() {
        let config = RelayConfig {
            port: 9000,
            bind_addr: "127.0.0.1".to_string(),
        };
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(RelayConfig::default().port, DEFAULT_RELAY_PORT);
    }

    #[tokio::test]
    async fn test_write_and_read_through_relay() {
        let relay = start_relay().await;
        let remote = client(&relay).await;

        remote
            .write("users/u/gameState", Some(serde_json::json!({"xp": 3})))
            .await
            .unwrap();
        let value = remote.read("users/u/gameState").await.unwrap();

        assert_eq!(value, Some(serde_json::json!({"xp": 3})));
        assert_eq!(relay.tree().peek("users/u/gameState").unwrap()["xp"], 3);
        assert_eq!(relay.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_listener_sees_other_client_writes() {
        let relay = start_relay().await;
        let laptop = client(&relay).await;
        let phone = client(&relay).await;

        let (handler, events) = recorder();
        let _sub = phone
            .subscribe("users/u/globalInbox", RemoteQuery::value(), handler)
            .await
            .unwrap();
        wait_for(|| events.lock().unwrap().len() == 1).await;

        laptop
            .write("users/u/globalInbox/milk", Some(Value::String("buy milk".into())))
            .await
            .unwrap();
        wait_for(|| events.lock().unwrap().len() == 2).await;

        let events = events.lock().unwrap();
        assert_eq!(events[0], RemoteEvent::Value(None));
        assert_eq!(
            events[1],
            RemoteEvent::Value(Some(serde_json::json!({"milk": "buy milk"})))
        );
    }

    #[tokio::test]
    async fn test_revoked_listener_reaches_client() {
        let relay = start_relay().await;
        let phone = client(&relay).await;

        let (handler, events) = recorder();
        let _sub = phone
            .subscribe("users/u/templates", RemoteQuery::value(), handler)
            .await
            .unwrap();
        wait_for(|| relay.tree().listener_count() == 1).await;

        relay.tree().revoke_listeners("users/u", "permission denied");
        wait_for(|| events.lock().unwrap().len() == 2).await;

        assert_eq!(
            events.lock().unwrap()[1],
            RemoteEvent::Error("permission denied".into())
        );
        assert_eq!(phone.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_relay_listener() {
        let relay = start_relay().await;
        let phone = client(&relay).await;

        let (handler, _events) = recorder();
        let sub = phone
            .subscribe("users/u/templates", RemoteQuery::start_at("a"), handler)
            .await
            .unwrap();
        wait_for(|| relay.tree().listener_count() == 1).await;

        drop(sub);
        wait_for(|| relay.tree().listener_count() == 0).await;
    }
}
