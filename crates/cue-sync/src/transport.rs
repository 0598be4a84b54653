//! # WebSocket Transport
//!
//! Terminal-side WebSocket client with automatic reconnection and backoff.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    WebSocket Connection States                          │
//! │                                                                         │
//! │  ┌────────────┐    connect()    ┌────────────┐                         │
//! │  │Disconnected│ ──────────────► │ Connecting │                         │
//! │  └────────────┘                 └─────┬──────┘                         │
//! │        ▲                              │                                 │
//! │        │                    success   │   failure                       │
//! │        │                        ┌─────┴─────┐                          │
//! │        │                        ▼           ▼                           │
//! │        │              ┌────────────┐  ┌────────────┐                   │
//! │        │              │ Connected  │  │ Backoff    │                   │
//! │        │              └─────┬──────┘  └─────┬──────┘                   │
//! │        │                    │               │                           │
//! │        │              disconnect/error      │  timer expired            │
//! │        │                    │               │                           │
//! │        │                    ▼               │                           │
//! │        │              ┌────────────┐        │                           │
//! │        └───────────── │Reconnecting│ ◄──────┘                          │
//! │                       └────────────┘                                    │
//! │                                                                         │
//! │  Every entry into Connected emits TransportEvent::Connected, which the │
//! │  agent answers with hello + snapshot_request.                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Outgoing frames queued while disconnected are dropped, not replayed:
//! the only frames a terminal sends are handshake, scoping and snapshot
//! requests, all of which are re-sent after the next connect.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::TerminalConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::SyncMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Transport State
// =============================================================================

/// Connection state for the WebSocket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before a reconnection attempt.
    Backoff,
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

/// What the transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A (re)connection completed. `attempt` is 0 for the first connect.
    Connected { attempt: u32 },
    Message(SyncMessage),
    Disconnected,
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Configuration for the WebSocket transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL to connect to.
    pub url: String,
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Maximum reconnection attempts (0 = infinite).
    pub max_retries: u32,
    /// Ping interval for keepalive.
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: String::new(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_retries: 0,
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Derives transport settings from a terminal configuration.
    pub fn from_terminal(config: &TerminalConfig) -> SyncResult<Self> {
        let url = config
            .hub_url()
            .ok_or_else(|| SyncError::InvalidConfig("Hub URL required".into()))?;

        Ok(TransportConfig {
            url: url.to_string(),
            connect_timeout: config.connect_timeout(),
            initial_backoff: Duration::from_millis(config.connection.initial_backoff_ms),
            max_backoff: Duration::from_secs(config.connection.max_backoff_secs),
            max_retries: config.connection.max_retries,
            ..Default::default()
        })
    }

    /// Exponential backoff with jitter between the configured bounds.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

// =============================================================================
// Transport Handle
// =============================================================================

/// Handle for interacting with the transport from other components.
#[derive(Clone)]
pub struct TransportHandle {
    outgoing_tx: mpsc::Sender<SyncMessage>,
    state: Arc<RwLock<ConnectionState>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl TransportHandle {
    /// Queues a frame for the current connection.
    pub async fn send(&self, message: SyncMessage) -> SyncResult<()> {
        self.outgoing_tx
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelError("Transport stopped".into()))
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send shutdown signal".into()))
    }
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// WebSocket transport with automatic reconnection.
///
/// ## Usage
/// ```rust,ignore
/// let (handle, mut events) = Transport::spawn(TransportConfig {
///     url: "ws://hall.local:8080/ws".into(),
///     ..Default::default()
/// });
///
/// while let Some(event) = events.recv().await {
///     if let TransportEvent::Connected { .. } = event {
///         handle.send(SyncMessage::SnapshotRequest).await?;
///     }
/// }
/// ```
pub struct Transport {
    config: TransportConfig,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_rx: mpsc::Receiver<SyncMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Transport {
    /// Creates a new transport and spawns its background task.
    pub fn spawn(config: TransportConfig) -> (TransportHandle, mpsc::Receiver<TransportEvent>) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<SyncMessage>(100);
        let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(256);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));

        let transport = Transport {
            config,
            state: state.clone(),
            outgoing_rx,
            events_tx,
            shutdown_rx,
        };

        tokio::spawn(transport.run());

        let handle = TransportHandle {
            outgoing_tx,
            state,
            shutdown_tx,
        };

        (handle, events_rx)
    }

    async fn run(mut self) {
        info!(url = %self.config.url, "Transport starting");

        let mut backoff = self.config.backoff();
        let mut retry_count = 0u32;
        let mut connects = 0u32;

        loop {
            if self.shutdown_rx.try_recv().is_ok() {
                info!("Transport received shutdown signal");
                break;
            }

            *self.state.write().await = ConnectionState::Connecting;

            match self.connect_with_timeout().await {
                Ok(ws_stream) => {
                    info!(attempt = connects, "WebSocket connected");
                    *self.state.write().await = ConnectionState::Connected;
                    backoff.reset();
                    retry_count = 0;

                    // Frames queued for the previous connection are stale.
                    while self.outgoing_rx.try_recv().is_ok() {}

                    if self.emit(TransportEvent::Connected { attempt: connects }).await.is_err() {
                        break;
                    }
                    connects += 1;

                    let result = self.connection_loop(ws_stream).await;
                    *self.state.write().await = ConnectionState::Backoff;
                    if self.emit(TransportEvent::Disconnected).await.is_err() {
                        break;
                    }
                    match result {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => warn!(?e, "Connection loop ended"),
                    }
                }
                Err(e) => {
                    error!(?e, "Failed to connect");
                }
            }

            *self.state.write().await = ConnectionState::Backoff;

            if self.config.max_retries > 0 {
                retry_count += 1;
                if retry_count >= self.config.max_retries {
                    error!(max_retries = self.config.max_retries, "Max reconnection attempts reached");
                    break;
                }
            }

            match backoff.next_backoff() {
                Some(duration) => {
                    debug!(?duration, attempt = retry_count, "Waiting before reconnect");
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {
                            *self.state.write().await = ConnectionState::Reconnecting;
                        }
                        _ = self.shutdown_rx.recv() => {
                            info!("Shutdown during backoff");
                            break;
                        }
                    }
                }
                None => {
                    error!("Backoff exhausted");
                    break;
                }
            }
        }

        *self.state.write().await = ConnectionState::Disconnected;
        info!("Transport stopped");
    }

    async fn emit(&self, event: TransportEvent) -> SyncResult<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| SyncError::ChannelError("Event receiver dropped".into()))
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

    /// Pumps frames until the connection drops. `Ok(true)` means shutdown
    /// was requested.
    async fn connection_loop(&mut self, ws_stream: WsStream) -> SyncResult<bool> {
        let (mut write, mut read) = ws_stream.split();

        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.outgoing_rx.recv() => {
                    let json = msg.to_json()?;
                    debug!(msg_type = %msg.type_name(), "Sending message");
                    write.send(WsMessage::Text(json.into())).await?;
                }

                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match SyncMessage::from_json(&text) {
                        Ok(msg) => {
                            debug!(msg_type = %msg.type_name(), "Received message");
                            if self.events_tx.send(TransportEvent::Message(msg)).await.is_err() {
                                return Err(SyncError::ChannelError("Event receiver dropped".into()));
                            }
                        }
                        Err(e) => warn!(?e, "Failed to parse message"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(false);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(?e, "WebSocket error");
                        return Err(SyncError::from(e));
                    }
                    None => return Err(SyncError::Disconnected),
                },

                _ = ping_interval.tick() => {
                    write.send(WsMessage::Ping(Default::default())).await?;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection");
                    let _ = write.send(WsMessage::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }
}
