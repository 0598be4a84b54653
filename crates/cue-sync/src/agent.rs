//! # Terminal Agent
//!
//! Runs a staff terminal's side of the hall: keeps the WebSocket to the hub
//! alive, feeds every frame into the [`TerminalCache`], and sends table
//! actions through the [`HallGateway`] with an optimistic overlay.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       TerminalAgent Architecture                        │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      TerminalHandle (UI side)                    │  │
//! │  │  dispatch(action) • submit_pin • join_room • table/session reads │  │
//! │  └───────┬───────────────────────┬───────────────────────┬──────────┘  │
//! │          │ HallGateway calls     │ TerminalEvent         │ PIN         │
//! │          ▼                       ▼                       ▼             │
//! │  ┌────────────────┐  ┌────────────────────┐  ┌────────────────────┐   │
//! │  │  hall server   │  │   TerminalCache    │  │  ElevationQueue    │   │
//! │  │  (REST)        │  │   (one reducer)    │  │  (actor)           │   │
//! │  └────────────────┘  └─────────▲──────────┘  └─────────┬──────────┘   │
//! │                                │                       │ expiry        │
//! │  ┌────────────────┐  ┌─────────┴──────────┐            │               │
//! │  │   Transport    │─►│   MessageRouter    │◄───────────┘               │
//! │  │  (WebSocket)   │  │ hello • snapshot   │                            │
//! │  └────────────────┘  │ retry • lag • pong │                            │
//! │                      └────────────────────┘                            │
//! │                                                                         │
//! │  EMITTED TO THE UI:                                                    │
//! │  • status   - connection state changes                                 │
//! │  • view     - the cache changed, re-render                             │
//! │  • notice   - conflict / timeout / rejection, non-blocking             │
//! │  • elevation - an action waits for a manager PIN                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconnect
//! Every `Connected` event restarts the handshake: hello with the current
//! room list, then `snapshot_request`. Unanswered snapshot requests are
//! re-sent up to `snapshot_retries` times, one action timeout apart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cue_core::{CoreError, CoreResult, RejectReason, Session, SessionView, Table, TableAction};

use crate::cache::{Notice, TerminalCache, TerminalEvent};
use crate::config::TerminalConfig;
use crate::elevation::{ElevationHandle, ElevationQueue, PendingElevation};
use crate::error::{SyncError, SyncResult};
use crate::gateway::HallGateway;
use crate::protocol::{SyncMessage, ERROR_LAGGED};
use crate::transport::{ConnectionState, Transport, TransportConfig, TransportEvent, TransportHandle};

// =============================================================================
// Terminal Status
// =============================================================================

/// Connection status for external queries.
#[derive(Debug, Clone)]
pub struct TerminalStatus {
    pub connection_state: ConnectionState,

    /// Hub instance from the last welcome. Changes when the server restarts.
    pub hub_id: Option<String>,

    /// When the current connection completed its handshake.
    pub connected_since: Option<DateTime<Utc>>,

    /// Last error reported by the hub.
    pub last_error: Option<String>,
}

impl Default for TerminalStatus {
    fn default() -> Self {
        TerminalStatus {
            connection_state: ConnectionState::Disconnected,
            hub_id: None,
            connected_since: None,
            last_error: None,
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Trait for pushing terminal events to the UI layer.
pub trait TerminalEventEmitter: Send + Sync {
    /// The connection status changed.
    fn emit_status(&self, status: &TerminalStatus);

    /// The cache changed; views should re-read it.
    fn emit_view_changed(&self);

    /// A conflict, timeout or rejection the operator should see.
    fn emit_notice(&self, notice: &Notice);

    /// An action is waiting for a manager PIN.
    fn emit_elevation(&self, pending: &PendingElevation);
}

/// No-op event emitter for headless use and tests.
pub struct NoOpEmitter;

impl TerminalEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &TerminalStatus) {}
    fn emit_view_changed(&self) {}
    fn emit_notice(&self, _notice: &Notice) {}
    fn emit_elevation(&self, _pending: &PendingElevation) {}
}

// =============================================================================
// Shared State
// =============================================================================

struct Shared {
    cache: RwLock<TerminalCache>,
    status: RwLock<TerminalStatus>,
    rooms: RwLock<Vec<String>>,
    emitter: Arc<dyn TerminalEventEmitter>,
}

impl Shared {
    /// Runs one event through the reducer and tells the UI what changed.
    async fn apply(&self, event: TerminalEvent) {
        let (changed, notices) = {
            let mut cache = self.cache.write().await;
            let changed = cache.apply(event);
            (changed, cache.drain_notices())
        };

        if changed {
            self.emitter.emit_view_changed();
        }
        for notice in &notices {
            self.emitter.emit_notice(notice);
        }
    }

    async fn set_status<F: FnOnce(&mut TerminalStatus)>(&self, f: F) {
        let status = {
            let mut status = self.status.write().await;
            f(&mut status);
            status.clone()
        };
        self.emitter.emit_status(&status);
    }
}

// =============================================================================
// Terminal Handle
// =============================================================================

/// Handle the terminal UI uses to act and to read the view.
#[derive(Clone)]
pub struct TerminalHandle {
    shared: Arc<Shared>,
    transport: TransportHandle,
    gateway: Arc<dyn HallGateway>,
    elevation: ElevationHandle,
    action_timeout: Duration,
    shutdown_tx: mpsc::Sender<()>,
}

impl TerminalHandle {
    /// Sends a table action, showing its predicted outcome until the server
    /// answers.
    ///
    /// ## Outcomes
    /// - `Ok(())`: accepted; the broadcast will confirm the overlay
    /// - `Unauthorized` with a `pending_id`: parked for a manager PIN, the
    ///   view is back on the confirmed state and the UI gets an elevation
    ///   prompt
    /// - any other error: view reverted, notice emitted
    /// - no answer within the action timeout: `NetworkFailure`, view reverted
    pub async fn dispatch(&self, action: TableAction) -> CoreResult<()> {
        let action_id = Uuid::new_v4().to_string();
        let table_id = action.table_id().to_string();

        self.shared
            .apply(TerminalEvent::ActionIssued {
                action_id: action_id.clone(),
                action: action.clone(),
                at: Utc::now(),
            })
            .await;

        let verdict = tokio::time::timeout(self.action_timeout, self.gateway.submit(&action_id, &action)).await;

        match verdict {
            Ok(Ok(())) => {
                debug!(action_id = %action_id, table_id = %table_id, "Action accepted");
                self.shared.apply(TerminalEvent::ActionAccepted { action_id }).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.shared
                    .apply(TerminalEvent::ActionRejected {
                        table_id,
                        action_id: Some(action_id),
                        reason: e.reason(),
                        message: e.to_string(),
                    })
                    .await;

                if let CoreError::Unauthorized {
                    pending_id: Some(pending_id),
                    ..
                } = &e
                {
                    let pending = PendingElevation::new(pending_id.clone(), action);
                    self.shared.emitter.emit_elevation(&pending);
                    if let Err(queue_err) = self.elevation.enqueue(pending).await {
                        error!(?queue_err, "Failed to park action for elevation");
                    }
                }
                Err(e)
            }
            Err(_) => {
                warn!(action_id = %action_id, table_id = %table_id, "Action timed out");
                self.shared.apply(TerminalEvent::ActionTimedOut { action_id }).await;
                Err(CoreError::NetworkFailure("No answer from the hall server".into()))
            }
        }
    }

    /// Presents a manager PIN for a parked action.
    pub async fn submit_pin(&self, pending_id: &str, pin: &str) -> CoreResult<()> {
        let result = self.elevation.submit_pin(pending_id, pin).await;
        if let Err(e) = &result {
            if e.reason() == RejectReason::TooManyAttempts {
                self.shared.emitter.emit_notice(&Notice {
                    table_id: None,
                    reason: RejectReason::TooManyAttempts,
                    message: e.to_string(),
                });
            }
        }
        result
    }

    pub async fn cancel_elevation(&self, pending_id: &str) -> CoreResult<()> {
        self.elevation.cancel(pending_id).await
    }

    pub async fn pending_elevations(&self) -> Vec<PendingElevation> {
        self.elevation.list().await
    }

    /// Follows another floor-plan room and refreshes the view.
    pub async fn join_room(&self, room: &str) -> SyncResult<()> {
        {
            let mut rooms = self.shared.rooms.write().await;
            if !rooms.iter().any(|r| r == room) {
                rooms.push(room.to_string());
            }
        }
        self.transport
            .send(SyncMessage::JoinRoom { room: room.to_string() })
            .await?;
        self.transport.send(SyncMessage::SnapshotRequest).await
    }

    /// Stops following a room and forgets its tables.
    pub async fn leave_room(&self, room: &str) -> SyncResult<()> {
        self.shared.rooms.write().await.retain(|r| r != room);
        self.shared
            .apply(TerminalEvent::RoomLeft { room: room.to_string() })
            .await;
        self.transport
            .send(SyncMessage::LeaveRoom { room: room.to_string() })
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn table(&self, table_id: &str) -> Option<Table> {
        self.shared.cache.read().await.table(table_id).cloned()
    }

    pub async fn tables_in_room(&self, room: &str) -> Vec<Table> {
        self.shared
            .cache
            .read()
            .await
            .tables_in_room(room)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn session_for_table(&self, table_id: &str) -> Option<Session> {
        self.shared.cache.read().await.session_for_table(table_id).cloned()
    }

    /// Session with its running amount, computed at `now` on this terminal.
    pub async fn session_view(&self, table_id: &str, now: DateTime<Utc>) -> Option<SessionView> {
        self.shared.cache.read().await.session_view(table_id, now)
    }

    pub async fn is_pending(&self, table_id: &str) -> bool {
        self.shared.cache.read().await.is_pending(table_id)
    }

    pub async fn active_layout(&self) -> Option<String> {
        self.shared.cache.read().await.active_layout().map(String::from)
    }

    pub async fn status(&self) -> TerminalStatus {
        self.shared.status.read().await.clone()
    }

    /// True until the first snapshot after a (re)connect or lag arrives.
    pub async fn is_stale(&self) -> bool {
        self.shared.cache.read().await.needs_snapshot()
    }

    /// Stops the router, the elevation queue and the transport.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.elevation.shutdown().await;
        let _ = self.transport.shutdown().await;
    }
}

// =============================================================================
// Terminal Agent
// =============================================================================

/// Builds and starts a terminal.
///
/// ## Usage
/// ```rust,ignore
/// let terminal = TerminalAgent::new(config, Arc::new(RestGateway::new(base_url)))
///     .with_emitter(Arc::new(UiEmitter::new(window)))
///     .start()?;
///
/// terminal.dispatch(TableAction::Pause { table_id, reason: None }).await?;
/// ```
pub struct TerminalAgent {
    config: TerminalConfig,
    gateway: Arc<dyn HallGateway>,
    emitter: Arc<dyn TerminalEventEmitter>,
}

impl TerminalAgent {
    pub fn new(config: TerminalConfig, gateway: Arc<dyn HallGateway>) -> Self {
        TerminalAgent {
            config,
            gateway,
            emitter: Arc::new(NoOpEmitter),
        }
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn TerminalEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Validates the config, spawns the background tasks and returns the
    /// handle.
    pub fn start(self) -> SyncResult<TerminalHandle> {
        self.config.validate()?;
        let transport_config = TransportConfig::from_terminal(&self.config)?;

        info!(
            terminal_id = %self.config.terminal_id(),
            hub_url = %transport_config.url,
            rooms = ?self.config.terminal.rooms,
            "Starting terminal agent"
        );

        let shared = Arc::new(Shared {
            cache: RwLock::new(TerminalCache::new()),
            status: RwLock::new(TerminalStatus::default()),
            rooms: RwLock::new(self.config.terminal.rooms.clone()),
            emitter: self.emitter,
        });

        let (transport, transport_rx) = Transport::spawn(transport_config);
        let (local_tx, local_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let elevation = ElevationQueue::spawn(
            self.gateway.clone(),
            self.config.elevation_ttl(),
            self.config.action_timeout(),
            local_tx,
        );

        let config = Arc::new(self.config);
        let router = MessageRouter {
            config: config.clone(),
            shared: shared.clone(),
            transport: transport.clone(),
            transport_rx,
            local_rx,
            shutdown_rx,
            snapshot_attempts: 0,
            snapshot_deadline: None,
        };
        tokio::spawn(router.run());

        Ok(TerminalHandle {
            shared,
            transport,
            gateway: self.gateway,
            elevation,
            action_timeout: config.action_timeout(),
            shutdown_tx,
        })
    }
}

// =============================================================================
// Message Router
// =============================================================================

struct MessageRouter {
    config: Arc<TerminalConfig>,
    shared: Arc<Shared>,
    transport: TransportHandle,
    transport_rx: mpsc::Receiver<TransportEvent>,
    local_rx: mpsc::Receiver<TerminalEvent>,
    shutdown_rx: mpsc::Receiver<()>,
    snapshot_attempts: u32,
    snapshot_deadline: Option<Instant>,
}

impl MessageRouter {
    async fn run(mut self) {
        loop {
            let deadline = self.snapshot_deadline;

            tokio::select! {
                event = self.transport_rx.recv() => match event {
                    Some(event) => self.on_transport(event).await,
                    None => {
                        info!("Transport stopped");
                        break;
                    }
                },

                Some(event) = self.local_rx.recv() => self.shared.apply(event).await,

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.retry_snapshot().await;
                }

                _ = self.shutdown_rx.recv() => {
                    info!("Message router received shutdown");
                    break;
                }
            }
        }

        self.shared
            .set_status(|s| s.connection_state = ConnectionState::Disconnected)
            .await;
        info!("Message router stopped");
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { attempt } => {
                info!(attempt, "Connected to hub, starting handshake");
                self.shared.apply(TerminalEvent::Connected).await;
                self.shared
                    .set_status(|s| s.connection_state = ConnectionState::Connected)
                    .await;

                let rooms = self.shared.rooms.read().await.clone();
                let hello = SyncMessage::hello(self.config.terminal_id(), self.config.hub.token.clone(), rooms);
                if let Err(e) = self.transport.send(hello).await {
                    error!(?e, "Failed to send hello");
                    return;
                }
                self.snapshot_attempts = 0;
                self.request_snapshot().await;
            }

            TransportEvent::Message(msg) => self.on_message(msg).await,

            TransportEvent::Disconnected => {
                warn!("Disconnected from hub");
                self.snapshot_deadline = None;
                self.shared.apply(TerminalEvent::Disconnected).await;
                self.shared
                    .set_status(|s| {
                        s.connection_state = ConnectionState::Backoff;
                        s.connected_since = None;
                    })
                    .await;
            }
        }
    }

    async fn on_message(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Welcome(welcome) => {
                info!(hub_id = %welcome.hub_id, "Handshake complete");
                self.shared
                    .set_status(|s| {
                        s.hub_id = Some(welcome.hub_id);
                        s.connected_since = Some(Utc::now());
                        s.last_error = None;
                    })
                    .await;
            }

            SyncMessage::Snapshot(snapshot) => {
                debug!(tables = snapshot.tables.len(), "Snapshot received");
                self.snapshot_deadline = None;
                self.snapshot_attempts = 0;
                self.shared.apply(TerminalEvent::Snapshot(snapshot)).await;
            }

            SyncMessage::TableUpdated(update) => {
                self.shared.apply(TerminalEvent::TableUpdated(update)).await;
            }

            SyncMessage::SessionUpdated(update) => {
                self.shared.apply(TerminalEvent::SessionUpdated(update)).await;
            }

            SyncMessage::LayoutActivated { layout_id } => {
                self.shared.apply(TerminalEvent::LayoutActivated { layout_id }).await;
            }

            SyncMessage::Ping { timestamp } => {
                if let Err(e) = self.transport.send(SyncMessage::pong(&timestamp)).await {
                    debug!(?e, "Failed to answer ping");
                }
            }

            SyncMessage::Pong { .. } => debug!("Received pong"),

            SyncMessage::Error { code, message } if code == ERROR_LAGGED => {
                warn!(message = %message, "Fell behind the hub, resyncing");
                self.shared.apply(TerminalEvent::Lagged).await;
                self.snapshot_attempts = 0;
                self.request_snapshot().await;
            }

            SyncMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Received error from hub");
                self.shared
                    .set_status(|s| s.last_error = Some(format!("{code}: {message}")))
                    .await;
            }

            other => debug!(msg_type = %other.type_name(), "Unhandled message type"),
        }
    }

    async fn request_snapshot(&mut self) {
        self.snapshot_attempts += 1;
        match self.transport.send(SyncMessage::SnapshotRequest).await {
            Ok(()) => {
                self.snapshot_deadline = Some(Instant::now() + self.config.action_timeout());
            }
            Err(e) => {
                error!(?e, "Failed to request snapshot");
                self.snapshot_deadline = None;
            }
        }
    }

    async fn retry_snapshot(&mut self) {
        if self.snapshot_attempts > self.config.connection.snapshot_retries {
            self.snapshot_deadline = None;
            let err = SyncError::Timeout(self.config.action_timeout().as_secs());
            warn!(attempts = self.snapshot_attempts, "Hub did not answer snapshot requests");
            self.shared.emitter.emit_notice(&Notice {
                table_id: None,
                reason: RejectReason::NetworkFailure,
                message: format!("Floor plan may be out of date: {err}"),
            });
            return;
        }

        debug!(attempt = self.snapshot_attempts, "Re-sending snapshot request");
        self.request_snapshot().await;
    }
}
