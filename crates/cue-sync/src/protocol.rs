//! # Event Channel Messages
//!
//! Frames exchanged between the hall server's hub and terminals.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Event Channel Messages                             │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  TERMINAL ───► hello { terminalId, token, rooms }                      │
//! │  HUB      ◄─── welcome { hubId, serverTime }                           │
//! │                                                                         │
//! │  SCOPING                                                               │
//! │  ───────                                                               │
//! │  TERMINAL ───► join_room { room } / leave_room { room }                │
//! │                                                                         │
//! │  UPDATES (hub → every terminal in the entity's room)                   │
//! │  ───────                                                               │
//! │  HUB      ───► table_updated   { entityId, newState, serverRevision }  │
//! │  HUB      ───► session_updated { entityId, newState, serverRevision }  │
//! │  HUB      ───► layout_activated { layoutId }      (all terminals)      │
//! │                                                                         │
//! │  RECOVERY                                                              │
//! │  ────────                                                              │
//! │  TERMINAL ───► snapshot_request                                        │
//! │  HUB      ───► snapshot { tables, sessions, serverTime }               │
//! │                                                                         │
//! │  KEEPALIVE / ERROR                                                     │
//! │  Both     ◄──► ping / pong,  error { code, message }                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "table_updated", "payload": { "entityId": "...", ... } }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cue_core::{Session, Table, ALL_ROOMS};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error code sent to a terminal whose subscription fell behind.
pub const ERROR_LAGGED: &str = "lagged";

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All event channel messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SyncMessage {
    // =========================================================================
    // Handshake
    // =========================================================================
    /// First frame from a terminal.
    Hello(HelloPayload),

    /// Hub reply once the terminal is registered.
    Welcome(WelcomePayload),

    // =========================================================================
    // Room Scoping
    // =========================================================================
    /// Subscribe to one floor-plan room (`*` for all).
    JoinRoom { room: String },

    /// Drop one room subscription.
    LeaveRoom { room: String },

    // =========================================================================
    // Entity Updates
    // =========================================================================
    /// A committed table change.
    TableUpdated(EntityUpdate<Table>),

    /// A committed session change.
    SessionUpdated(EntityUpdate<Session>),

    /// A floor plan became the active layout.
    #[serde(rename_all = "camelCase")]
    LayoutActivated { layout_id: String },

    // =========================================================================
    // Recovery
    // =========================================================================
    /// Ask for the full current state (sent after every reconnect).
    SnapshotRequest,

    /// Full current state for the terminal's rooms.
    Snapshot(SnapshotPayload),

    // =========================================================================
    // Keepalive
    // =========================================================================
    Ping { timestamp: String },

    #[serde(rename_all = "camelCase")]
    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },

    // =========================================================================
    // Errors
    // =========================================================================
    Error { code: String, message: String },
}

// =============================================================================
// Payloads
// =============================================================================

/// Hello sent by a terminal on connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Terminal identifier.
    pub terminal_id: String,

    /// Bearer token from the identity provider, when the hub requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Protocol version supported by this terminal.
    pub protocol_version: u32,

    /// Rooms to join right away.
    #[serde(default = "default_rooms")]
    pub rooms: Vec<String>,
}

fn default_rooms() -> Vec<String> {
    vec![ALL_ROOMS.to_string()]
}

/// Welcome sent by the hub after a successful hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Hub instance identifier (changes on server restart).
    pub hub_id: String,

    pub protocol_version: u32,

    /// Server time for clock reference.
    pub server_time: DateTime<Utc>,
}

/// `{type, entityId, newState, serverRevision}` for one committed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityUpdate<T> {
    pub entity_id: String,

    /// The entity exactly as committed.
    pub new_state: T,

    /// Revision assigned at commit. Strictly increasing per entity.
    pub server_revision: i64,

    /// Floor-plan room the entity belongs to.
    pub room: String,
}

/// Everything a terminal needs to rebuild its view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    pub tables: Vec<Table>,

    /// Sessions still attached to a table (open, or settled but not yet
    /// cleaned).
    pub sessions: Vec<Session>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_layout: Option<String>,

    pub server_time: DateTime<Utc>,
}

// =============================================================================
// Helper Functions
// =============================================================================

impl SyncMessage {
    /// Returns the wire type name (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "hello",
            SyncMessage::Welcome(_) => "welcome",
            SyncMessage::JoinRoom { .. } => "join_room",
            SyncMessage::LeaveRoom { .. } => "leave_room",
            SyncMessage::TableUpdated(_) => "table_updated",
            SyncMessage::SessionUpdated(_) => "session_updated",
            SyncMessage::LayoutActivated { .. } => "layout_activated",
            SyncMessage::SnapshotRequest => "snapshot_request",
            SyncMessage::Snapshot(_) => "snapshot",
            SyncMessage::Ping { .. } => "ping",
            SyncMessage::Pong { .. } => "pong",
            SyncMessage::Error { .. } => "error",
        }
    }

    /// Room this message is scoped to. `None` means every terminal.
    pub fn room(&self) -> Option<&str> {
        match self {
            SyncMessage::TableUpdated(update) => Some(&update.room),
            SyncMessage::SessionUpdated(update) => Some(&update.room),
            _ => None,
        }
    }

    /// Creates a Hello message.
    pub fn hello(terminal_id: &str, token: Option<String>, rooms: Vec<String>) -> Self {
        SyncMessage::Hello(HelloPayload {
            terminal_id: terminal_id.to_string(),
            token,
            protocol_version: PROTOCOL_VERSION,
            rooms,
        })
    }

    /// Creates a `table_updated` message from a committed table.
    pub fn table_updated(table: &Table) -> Self {
        SyncMessage::TableUpdated(EntityUpdate {
            entity_id: table.id.clone(),
            new_state: table.clone(),
            server_revision: table.revision,
            room: table.room.clone(),
        })
    }

    /// Creates a `session_updated` message; `room` is the owning table's.
    pub fn session_updated(session: &Session, room: &str) -> Self {
        SyncMessage::SessionUpdated(EntityUpdate {
            entity_id: session.id.clone(),
            new_state: session.clone(),
            server_revision: session.revision,
            room: room.to_string(),
        })
    }

    /// Creates a Ping message.
    pub fn ping() -> Self {
        SyncMessage::Ping {
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Creates a Pong message.
    pub fn pong(ping_timestamp: &str) -> Self {
        SyncMessage::Pong {
            ping_timestamp: ping_timestamp.to_string(),
            pong_timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Creates an Error message.
    pub fn error(code: &str, message: &str) -> Self {
        SyncMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
