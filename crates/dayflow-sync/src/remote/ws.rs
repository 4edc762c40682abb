//! # WebSocket Remote
//!
//! [`RemoteStore`] over a WebSocket connection to the relay, with automatic
//! reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │         disconnect/error           │  timer expired            │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  ON CONNECT: every live listener is subscribed again                   │
//! │  ON DISCONNECT: pending requests fail with Disconnected                │
//! │  WHILE DISCONNECTED: write/read fail fast with Disconnected            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests carry a `request_id` and are matched to their `Ack`,
//! `ReadResult` or `Error` frame through a oneshot channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{RemoteEvent, RemoteHandler, RemoteQuery, RemoteStore, Subscription};
use crate::config::RemoteSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::RelayMessage;

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of a [`WsRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready.
    Connected,
    /// Waiting before reconnection attempt.
    Backoff,
    /// Reconnection in progress.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Backoff => write!(f, "backoff"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the WebSocket remote.
#[derive(Debug, Clone)]
pub struct WsRemoteConfig {
    /// Relay WebSocket URL.
    pub url: String,

    /// Connection timeout.
    pub connect_timeout: Duration,

    /// Time to wait for a request's answer.
    pub request_timeout: Duration,

    /// Initial backoff duration.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl Default for WsRemoteConfig {
    fn default() -> Self {
        WsRemoteConfig::from_parts(String::new(), &RemoteSettings::default())
    }
}

impl WsRemoteConfig {
    /// Builds the transport config from the `[remote]` section.
    pub fn from_settings(settings: &RemoteSettings) -> SyncResult<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| SyncError::InvalidConfig("remote.url is not set".into()))?;
        url::Url::parse(&url)?;
        Ok(WsRemoteConfig::from_parts(url, settings))
    }

    fn from_parts(url: String, settings: &RemoteSettings) -> Self {
        WsRemoteConfig {
            url,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

type Reply = oneshot::Sender<SyncResult<Option<Value>>>;

struct RemoteListener {
    path: String,
    start_at: Option<String>,
    handler: RemoteHandler,
}

impl RemoteListener {
    fn subscribe_frame(&self, subscription_id: u64) -> RelayMessage {
        RelayMessage::Subscribe {
            subscription_id,
            path: self.path.clone(),
            start_at: self.start_at.clone(),
        }
    }
}

struct Shared {
    state: Mutex<ConnectionState>,
    pending: Mutex<HashMap<u64, Reply>>,
    listeners: Mutex<HashMap<u64, RemoteListener>>,
    next_id: AtomicU64,
    outgoing_tx: mpsc::UnboundedSender<RelayMessage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: RelayMessage) -> SyncResult<()> {
        self.outgoing_tx
            .send(message)
            .map_err(|_| SyncError::ChannelError("Connection task stopped".into()))
    }

    fn resolve(&self, request_id: u64, result: SyncResult<Option<Value>>) {
        match lock(&self.pending).remove(&request_id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!(request_id, "Answer for unknown or expired request"),
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<Reply> = lock(&self.pending).drain().map(|(_, reply)| reply).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), "Failing in-flight requests");
        }
        for reply in pending {
            let _ = reply.send(Err(SyncError::Disconnected));
        }
    }

    fn dispatch_event(&self, subscription_id: u64, event: RemoteEvent, remove: bool) {
        let handler = {
            let mut listeners = lock(&self.listeners);
            if remove {
                listeners.remove(&subscription_id).map(|l| l.handler)
            } else {
                listeners.get(&subscription_id).map(|l| l.handler.clone())
            }
        };
        match handler {
            Some(handler) => handler(event),
            None => debug!(subscription_id, "Event for unknown listener"),
        }
    }
}

// =============================================================================
// WebSocket Remote
// =============================================================================

/// Remote tree reached through the relay.
///
/// ## Usage
/// ```rust,ignore
/// let remote = WsRemote::spawn(WsRemoteConfig {
///     url: "ws://localhost:8787/ws".into(),
///     ..Default::default()
/// });
/// remote.wait_connected(Duration::from_secs(5)).await?;
/// remote.write("users/u/gameState", Some(envelope)).await?;
/// ```
pub struct WsRemote {
    shared: Arc<Shared>,
    request_timeout: Duration,
    shutdown_tx: mpsc::Sender<()>,
}

impl WsRemote {
    /// Starts the connection task. Returns immediately; requests fail with
    /// [`SyncError::Disconnected`] until the connection is up.
    pub fn spawn(config: WsRemoteConfig) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            state: Mutex::new(ConnectionState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            outgoing_tx,
        });

        let request_timeout = config.request_timeout;
        let connection = Connection {
            config,
            shared: Arc::downgrade(&shared),
            outgoing_rx,
            shutdown_rx,
        };
        tokio::spawn(connection.run());

        WsRemote {
            shared,
            request_timeout,
            shutdown_tx,
        }
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns true if currently connected.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Polls until connected or `within` elapses.
    pub async fn wait_connected(&self, within: Duration) -> SyncResult<()> {
        let poll = async {
            while !self.is_connected() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        timeout(within, poll)
            .await
            .map_err(|_| SyncError::Timeout(within.as_secs()))
    }

    /// Number of listeners this client keeps alive across reconnects.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    /// Closes the connection and stops reconnecting.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }

    async fn request(&self, build: impl FnOnce(u64) -> RelayMessage) -> SyncResult<Option<Value>> {
        if !self.is_connected() {
            return Err(SyncError::Disconnected);
        }

        let request_id = self.shared.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.shared.pending).insert(request_id, reply_tx);

        if let Err(e) = self.shared.send(build(request_id)) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e);
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                lock(&self.shared.pending).remove(&request_id);
                Err(SyncError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl RemoteStore for WsRemote {
    async fn write(&self, path: &str, value: Option<Value>) -> SyncResult<()> {
        self.request(|request_id| RelayMessage::Write {
            request_id,
            path: path.to_string(),
            value,
        })
        .await
        .map(|_| ())
    }

    async fn read(&self, path: &str) -> SyncResult<Option<Value>> {
        self.request(|request_id| RelayMessage::Read {
            request_id,
            path: path.to_string(),
        })
        .await
    }

    /// Registers the listener locally and subscribes on the relay. While
    /// disconnected the subscribe frame is sent once the connection is up.
    async fn subscribe(
        &self,
        path: &str,
        query: RemoteQuery,
        handler: RemoteHandler,
    ) -> SyncResult<Subscription> {
        let subscription_id = self.shared.next_id();
        let listener = RemoteListener {
            path: path.to_string(),
            start_at: query.start_at,
            handler,
        };
        let frame = listener.subscribe_frame(subscription_id);
        lock(&self.shared.listeners).insert(subscription_id, listener);

        if self.is_connected() {
            self.shared.send(frame)?;
        }
        debug!(subscription_id, path = %path, "Listener registered");

        let shared = Arc::downgrade(&self.shared);
        Ok(Subscription::new(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if lock(&shared.listeners).remove(&subscription_id).is_some()
                && shared.state() == ConnectionState::Connected
            {
                let _ = shared.send(RelayMessage::Unsubscribe { subscription_id });
            }
        }))
    }
}

// =============================================================================
// Connection Task
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Connection {
    config: WsRemoteConfig,
    shared: Weak<Shared>,
    outgoing_rx: mpsc::UnboundedReceiver<RelayMessage>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Connection {
    /// Main connection loop.
    async fn run(mut self) {
        info!(url = %self.config.url, "Remote connection starting");

        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Remote connection received shutdown signal");
                break;
            }
            let Some(shared) = self.shared.upgrade() else {
                debug!("Remote dropped, stopping connection task");
                break;
            };

            shared.set_state(ConnectionState::Connecting);
            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!("Relay connected");
                    backoff.reset();
                    attempt = 0;

                    // Frames queued while offline belong to requests that already failed.
                    while self.outgoing_rx.try_recv().is_ok() {}

                    let result = self.connection_loop(&shared, ws_stream).await;
                    shared.set_state(ConnectionState::Backoff);
                    shared.fail_pending();
                    match result {
                        Ok(true) => break,
                        Ok(false) => info!("Relay connection closed"),
                        Err(e) => warn!(error = %e, "Relay connection lost"),
                    }
                }
                Err(e) => {
                    shared.set_state(ConnectionState::Backoff);
                    error!(error = %e, "Failed to connect to relay");
                }
            }
            drop(shared);

            attempt += 1;
            let Some(duration) = backoff.next_backoff() else {
                error!("Backoff exhausted");
                break;
            };
            debug!(?duration, attempt, "Waiting before reconnect");

            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    if let Some(shared) = self.shared.upgrade() {
                        shared.set_state(ConnectionState::Reconnecting);
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown during backoff");
                    break;
                }
            }
        }

        if let Some(shared) = self.shared.upgrade() {
            shared.set_state(ConnectionState::Disconnected);
            shared.fail_pending();
        }
        info!("Remote connection stopped");
    }

    async fn connect_with_timeout(&self) -> SyncResult<WsStream> {
        match timeout(self.config.connect_timeout, connect_async(&self.config.url)).await {
            Ok(Ok((ws_stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(ws_stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    /// Runs one connection. Returns `Ok(true)` on shutdown.
    async fn connection_loop(&mut self, shared: &Shared, ws_stream: WsStream) -> SyncResult<bool> {
        let (mut write, mut read) = ws_stream.split();

        let resubscribe: Vec<RelayMessage> = lock(&shared.listeners)
            .iter()
            .map(|(id, listener)| listener.subscribe_frame(*id))
            .collect();
        if !resubscribe.is_empty() {
            info!(listeners = resubscribe.len(), "Restoring listeners");
        }
        for frame in resubscribe {
            write.send(WsMessage::Text(frame.to_json()?.into())).await?;
        }
        shared.set_state(ConnectionState::Connected);

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.outgoing_rx.recv() => {
                    debug!(msg_type = %msg.type_name(), "Sending frame");
                    write.send(WsMessage::Text(msg.to_json()?.into())).await?;
                }

                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match RelayMessage::from_json(text.as_str()) {
                        Ok(msg) => handle_frame(shared, msg),
                        Err(e) => warn!(error = %e, "Failed to parse frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Pong(_))) => debug!("Received pong"),
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(false);
                    }
                    Some(Ok(WsMessage::Binary(_))) => warn!("Received unexpected binary message"),
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => return Err(SyncError::from(e)),
                    None => return Ok(false),
                },

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(Vec::new().into())).await?;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

fn handle_frame(shared: &Shared, msg: RelayMessage) {
    match msg {
        RelayMessage::Ack { request_id } => shared.resolve(request_id, Ok(None)),
        RelayMessage::ReadResult { request_id, value } => shared.resolve(request_id, Ok(value)),
        RelayMessage::Event {
            subscription_id,
            value,
        } => shared.dispatch_event(subscription_id, RemoteEvent::Value(value), false),
        RelayMessage::Error {
            request_id,
            subscription_id,
            message,
        } => {
            if let Some(request_id) = request_id {
                shared.resolve(request_id, Err(SyncError::Remote(message.clone())));
            }
            if let Some(subscription_id) = subscription_id {
                warn!(subscription_id, message = %message, "Relay cancelled listener");
                shared.dispatch_event(subscription_id, RemoteEvent::Error(message), true);
            }
        }
        other => warn!(msg_type = %other.type_name(), "Unexpected frame from relay"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Backoff.to_string(), "backoff");
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = RemoteSettings::default();
        assert!(WsRemoteConfig::from_settings(&settings).is_err());

        settings.url = Some("ws://127.0.0.1:8787/ws".into());
        settings.request_timeout_secs = 3;
        let config = WsRemoteConfig::from_settings(&settings).unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_requests_fail_fast_while_disconnected() {
        let remote = WsRemote::spawn(WsRemoteConfig {
            url: "ws://127.0.0.1:1/ws".into(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        });

        assert!(matches!(
            remote.write("users/u/x", None).await,
            Err(SyncError::Disconnected)
        ));
        assert!(matches!(remote.read("users/u/x").await, Err(SyncError::Disconnected)));

        let handler: RemoteHandler = Arc::new(|_| {});
        let sub = remote
            .subscribe("users/u/x", RemoteQuery::value(), handler)
            .await
            .unwrap();
        assert_eq!(remote.listener_count(), 1);
        sub.cancel();
        assert_eq!(remote.listener_count(), 0);

        remote.shutdown().await.unwrap();
    }
}
