//! # Hub
//!
//! The server end of the event channel. Every committed table or session
//! change is published here and fanned out to the terminals subscribed to
//! the entity's floor-plan room.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Hub Architecture                              │
//! │                                                                         │
//! │  SessionManager ── commit ──► HubHandle::publish(msg)                  │
//! │                                    │                                    │
//! │                                    ▼                                    │
//! │                        broadcast::Sender<SyncMessage>                   │
//! │                                    │                                    │
//! │         ┌──────────────────────────┼──────────────────────────┐        │
//! │         ▼                          ▼                          ▼         │
//! │  ┌──────────────┐          ┌──────────────┐          ┌──────────────┐  │
//! │  │ Terminal A   │          │ Terminal B   │          │ Terminal C   │  │
//! │  │ rooms: main  │          │ rooms: *     │          │ rooms: vip   │  │
//! │  └──────────────┘          └──────────────┘          └──────────────┘  │
//! │                                                                         │
//! │  Per connection:                                                        │
//! │  1. Terminal sends hello (token checked by the HubBackend)             │
//! │  2. Hub subscribes, then replies welcome                               │
//! │  3. Updates outside the terminal's rooms are skipped                   │
//! │  4. snapshot_request is answered from the HubBackend                   │
//! │  5. A lagging subscriber gets error{lagged} and should re-snapshot     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-entity order is the order of `publish` calls. The server publishes
//! while it still holds the entity's lease, so that is commit order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cue_core::ALL_ROOMS;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    HelloPayload, SnapshotPayload, SyncMessage, WelcomePayload, ERROR_LAGGED, PROTOCOL_VERSION,
};

// =============================================================================
// Constants
// =============================================================================

/// Maximum inbound frame size (1MB).
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Per-connection outgoing queue depth.
const OUTGOING_QUEUE: usize = 64;

// =============================================================================
// Hub Configuration
// =============================================================================

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast buffer. A terminal further behind than this lags.
    pub channel_capacity: usize,
    /// How long a new connection may take to send hello.
    pub hello_timeout: Duration,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            channel_capacity: 256,
            hello_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Backend Seam
// =============================================================================

/// What the hub needs from the server that owns it.
pub trait HubBackend: Send + Sync + 'static {
    /// Accepts or refuses a terminal's hello.
    fn authenticate(&self, hello: &HelloPayload) -> SyncResult<()>;

    /// Current state of every table and attached session.
    fn snapshot(&self) -> BoxFuture<'_, SyncResult<SnapshotPayload>>;
}

// =============================================================================
// Rooms
// =============================================================================

/// The floor-plan rooms a terminal listens to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSet {
    rooms: HashSet<String>,
}

impl RoomSet {
    pub fn new<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RoomSet {
            rooms: rooms.into_iter().map(Into::into).collect(),
        }
    }

    pub fn join(&mut self, room: &str) {
        self.rooms.insert(room.to_string());
    }

    pub fn leave(&mut self, room: &str) {
        self.rooms.remove(room);
    }

    /// True if updates for `room` should reach this terminal.
    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains(ALL_ROOMS) || self.rooms.contains(room)
    }

    /// True if `msg` should be forwarded. Unscoped messages always pass.
    pub fn admits(&self, msg: &SyncMessage) -> bool {
        msg.room().map_or(true, |room| self.contains(room))
    }

    /// Narrows a full snapshot to these rooms.
    pub fn filter(&self, snapshot: SnapshotPayload) -> SnapshotPayload {
        let tables: Vec<_> = snapshot
            .tables
            .into_iter()
            .filter(|t| self.contains(&t.room))
            .collect();
        let visible: HashSet<&str> = tables.iter().map(|t| t.id.as_str()).collect();
        let sessions = snapshot
            .sessions
            .into_iter()
            .filter(|s| visible.contains(s.table_id.as_str()))
            .collect();

        SnapshotPayload {
            tables,
            sessions,
            active_layout: snapshot.active_layout,
            server_time: snapshot.server_time,
        }
    }
}

// =============================================================================
// Hub State
// =============================================================================

/// A registered terminal connection.
#[derive(Debug, Clone)]
pub struct ConnectedTerminal {
    pub terminal_id: String,
    pub connected_at: std::time::Instant,
}

struct HubState {
    config: HubConfig,
    hub_id: String,
    backend: Arc<dyn HubBackend>,
    clients: RwLock<HashMap<String, ConnectedTerminal>>,
    broadcast_tx: broadcast::Sender<SyncMessage>,
}

// =============================================================================
// Hub Handle
// =============================================================================

/// Cloneable handle used by the server to publish and to mount `/ws`.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<HubState>,
}

impl HubHandle {
    pub fn new(config: HubConfig, backend: Arc<dyn HubBackend>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let state = HubState {
            config,
            hub_id: Uuid::new_v4().to_string(),
            backend,
            clients: RwLock::new(HashMap::new()),
            broadcast_tx,
        };
        HubHandle {
            state: Arc::new(state),
        }
    }

    /// Publishes a committed change. Returns how many connections it
    /// reached; zero terminals connected is not an error.
    pub fn publish(&self, msg: SyncMessage) -> usize {
        debug!(msg_type = %msg.type_name(), "Publishing");
        self.state.broadcast_tx.send(msg).unwrap_or(0)
    }

    /// Subscribes to the raw stream (in-process listeners and tests).
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.state.broadcast_tx.subscribe()
    }

    pub fn hub_id(&self) -> &str {
        &self.state.hub_id
    }

    pub async fn client_count(&self) -> usize {
        self.state.clients.read().await.len()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        self.state.clients.read().await.keys().cloned().collect()
    }

    /// Router exposing `GET /ws`, ready to merge into the API router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sender, mut receiver) = socket.split();

    let hello = match receive_hello(&mut receiver, state.config.hello_timeout).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(?e, "Failed to receive hello - closing connection");
            return;
        }
    };
    let terminal_id = hello.terminal_id.clone();

    if hello.protocol_version != PROTOCOL_VERSION {
        warn!(terminal_id = %terminal_id, version = hello.protocol_version, "Unsupported protocol version");
        let reject = SyncMessage::error("unsupported_version", "Protocol version mismatch");
        let _ = send_message(&mut sender, &reject).await;
        return;
    }

    if let Err(e) = state.backend.authenticate(&hello) {
        warn!(terminal_id = %terminal_id, error = %e, "Terminal rejected");
        let reject = SyncMessage::error("unauthorized", &e.to_string());
        let _ = send_message(&mut sender, &reject).await;
        return;
    }

    // Subscribe before welcome so nothing committed after it is missed.
    let mut broadcast_rx = state.broadcast_tx.subscribe();

    let welcome = SyncMessage::Welcome(WelcomePayload {
        hub_id: state.hub_id.clone(),
        protocol_version: PROTOCOL_VERSION,
        server_time: Utc::now(),
    });
    if let Err(e) = send_message(&mut sender, &welcome).await {
        warn!(terminal_id = %terminal_id, ?e, "Failed to send welcome");
        return;
    }

    state.clients.write().await.insert(
        terminal_id.clone(),
        ConnectedTerminal {
            terminal_id: terminal_id.clone(),
            connected_at: std::time::Instant::now(),
        },
    );
    let mut rooms = RoomSet::new(hello.rooms);
    info!(terminal_id = %terminal_id, ?rooms, "Terminal connected");

    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_QUEUE);
    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(state.config.ping_interval);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match SyncMessage::from_json(&text) {
                        Ok(msg) => {
                            if let Some(reply) = handle_terminal_message(&state, &terminal_id, &mut rooms, msg).await {
                                if queue(&outgoing_tx, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => debug!(terminal_id = %terminal_id, ?e, "Invalid message format"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = outgoing_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!(terminal_id = %terminal_id, "Terminal requested close");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(terminal_id = %terminal_id, ?e, "WebSocket error");
                    break;
                }
                None => {
                    info!(terminal_id = %terminal_id, "Terminal disconnected");
                    break;
                }
            },

            event = broadcast_rx.recv() => match event {
                Ok(msg) => {
                    if rooms.admits(&msg) && queue(&outgoing_tx, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(terminal_id = %terminal_id, skipped, "Terminal lagged");
                    let notice = SyncMessage::error(ERROR_LAGGED, &format!("{skipped} events dropped"));
                    if queue(&outgoing_tx, &notice).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = ping_interval.tick() => {
                if outgoing_tx.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    outgoing_handle.abort();
    if state.clients.write().await.remove(&terminal_id).is_some() {
        info!(terminal_id = %terminal_id, "Terminal removed");
    }
}

/// Answers one terminal frame. Returns the reply, if any.
async fn handle_terminal_message(
    state: &HubState,
    terminal_id: &str,
    rooms: &mut RoomSet,
    msg: SyncMessage,
) -> Option<SyncMessage> {
    debug!(terminal_id = %terminal_id, msg_type = %msg.type_name(), "Received terminal message");

    match msg {
        SyncMessage::JoinRoom { room } => {
            rooms.join(&room);
            None
        }
        SyncMessage::LeaveRoom { room } => {
            rooms.leave(&room);
            None
        }
        SyncMessage::SnapshotRequest => match state.backend.snapshot().await {
            Ok(snapshot) => Some(SyncMessage::Snapshot(rooms.filter(snapshot))),
            Err(e) => {
                warn!(terminal_id = %terminal_id, error = %e, "Snapshot failed");
                Some(SyncMessage::error("snapshot_failed", &e.to_string()))
            }
        },
        SyncMessage::Ping { timestamp } => Some(SyncMessage::pong(&timestamp)),
        SyncMessage::Pong { .. } => None,
        other => Some(SyncMessage::error(
            "unexpected_message",
            &format!("{} is not accepted from terminals", other.type_name()),
        )),
    }
}

async fn receive_hello(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    hello_timeout: Duration,
) -> SyncResult<HelloPayload> {
    match tokio::time::timeout(hello_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match SyncMessage::from_json(&text)? {
            SyncMessage::Hello(payload) => Ok(payload),
            other => Err(SyncError::UnexpectedMessageType {
                expected: "hello".into(),
                actual: other.type_name().into(),
            }),
        },
        Ok(Some(Ok(_))) => Err(SyncError::InvalidMessage("Expected text frame".into())),
        Ok(Some(Err(e))) => Err(SyncError::WebSocketError(e.to_string())),
        Ok(None) => Err(SyncError::Disconnected),
        Err(_) => Err(SyncError::Timeout(hello_timeout.as_secs())),
    }
}

async fn send_message(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &SyncMessage,
) -> SyncResult<()> {
    let json = msg.to_json()?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(e.to_string()))
}

async fn queue(outgoing: &mpsc::Sender<Message>, msg: &SyncMessage) -> SyncResult<()> {
    let json = msg.to_json()?;
    outgoing
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| SyncError::ChannelError("Outgoing queue closed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cue_core::{Table, TableStatus};
    use futures_util::FutureExt;

    struct FixedBackend {
        tables: Vec<Table>,
    }

    impl HubBackend for FixedBackend {
        fn authenticate(&self, hello: &HelloPayload) -> SyncResult<()> {
            match hello.token.as_deref() {
                Some("good") => Ok(()),
                _ => Err(SyncError::Rejected {
                    code: "unauthorized".into(),
                    message: "bad token".into(),
                }),
            }
        }

        fn snapshot(&self) -> BoxFuture<'_, SyncResult<SnapshotPayload>> {
            let snapshot = SnapshotPayload {
                tables: self.tables.clone(),
                sessions: Vec::new(),
                active_layout: None,
                server_time: Utc::now(),
            };
            async move { Ok(snapshot) }.boxed()
        }
    }

    fn table(name: &str, room: &str) -> Table {
        Table::new(name, 4, room, Utc::now()).unwrap()
    }

    fn hub(tables: Vec<Table>) -> HubHandle {
        HubHandle::new(HubConfig::default(), Arc::new(FixedBackend { tables }))
    }

    #[test]
    fn test_room_set_wildcard_and_membership() {
        let all = RoomSet::new(["*"]);
        assert!(all.contains("vip"));

        let mut rooms = RoomSet::new(["main"]);
        assert!(rooms.contains("main"));
        assert!(!rooms.contains("vip"));

        rooms.join("vip");
        rooms.leave("main");
        assert!(rooms.contains("vip"));
        assert!(!rooms.contains("main"));
    }

    #[test]
    fn test_layout_activation_reaches_every_room() {
        let rooms = RoomSet::new(["vip"]);
        let layout = SyncMessage::LayoutActivated { layout_id: "l1".into() };
        let main_update = SyncMessage::table_updated(&table("T1", "main"));

        assert!(rooms.admits(&layout));
        assert!(!rooms.admits(&main_update));
    }

    #[test]
    fn test_snapshot_filtered_to_rooms() {
        let snapshot = SnapshotPayload {
            tables: vec![table("T1", "main"), table("V1", "vip")],
            sessions: Vec::new(),
            active_layout: Some("l1".into()),
            server_time: Utc::now(),
        };

        let filtered = RoomSet::new(["vip"]).filter(snapshot);
        assert_eq!(filtered.tables.len(), 1);
        assert_eq!(filtered.tables[0].room, "vip");
        assert_eq!(filtered.active_layout.as_deref(), Some("l1"));
    }

    #[tokio::test]
    async fn test_publish_preserves_per_entity_order() {
        let hub = hub(Vec::new());
        let mut rx = hub.subscribe();

        let mut t = table("T1", "main");
        for (rev, status) in [(1, TableStatus::Occupied), (2, TableStatus::Paused), (3, TableStatus::Occupied)] {
            t.revision = rev;
            t.status = status;
            assert_eq!(hub.publish(SyncMessage::table_updated(&t)), 1);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            if let SyncMessage::TableUpdated(update) = rx.recv().await.unwrap() {
                seen.push(update.server_revision);
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let hub = hub(Vec::new());
        assert_eq!(hub.publish(SyncMessage::ping()), 0);
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_request_answered_from_backend() {
        let hub = hub(vec![table("T1", "main"), table("V1", "vip")]);
        let mut rooms = RoomSet::new(["main"]);

        let reply = handle_terminal_message(&hub.state, "term-1", &mut rooms, SyncMessage::SnapshotRequest).await;
        match reply {
            Some(SyncMessage::Snapshot(snapshot)) => assert_eq!(snapshot.tables.len(), 1),
            other => panic!("Expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_cannot_publish_updates() {
        let hub = hub(Vec::new());
        let mut rooms = RoomSet::new(["*"]);
        let forged = SyncMessage::table_updated(&table("T1", "main"));

        let reply = handle_terminal_message(&hub.state, "term-1", &mut rooms, forged).await;
        assert!(matches!(reply, Some(SyncMessage::Error { code, .. }) if code == "unexpected_message"));
    }

    #[test]
    fn test_backend_rejects_bad_token() {
        let backend = FixedBackend { tables: Vec::new() };
        let mut hello = HelloPayload {
            terminal_id: "t".into(),
            token: Some("bad".into()),
            protocol_version: PROTOCOL_VERSION,
            rooms: Vec::new(),
        };
        assert!(backend.authenticate(&hello).is_err());
        hello.token = Some("good".into());
        assert!(backend.authenticate(&hello).is_ok());
    }
}
