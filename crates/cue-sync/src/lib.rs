//! # cue-sync: Live Table State for Cue Hall
//!
//! Both ends of the event channel that keeps every staff terminal showing
//! the same floor plan: the hub mounted in the hall server, and the terminal
//! agent that holds each terminal's optimistic view.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Layer Architecture                          │
//! │                                                                         │
//! │  HALL SERVER                                                           │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  commit (table, session) ──► HubHandle::publish                  │  │
//! │  │                                   │  one broadcast channel,      │  │
//! │  │                                   │  commit order = send order   │  │
//! │  │                                   ▼                              │  │
//! │  │          /ws  ──► per-terminal task ──► RoomSet filter ──► WS    │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! │  TERMINAL                                                              │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Transport (reconnect + backoff)                                 │  │
//! │  │      │ hello, snapshot_request on every connect                  │  │
//! │  │      ▼                                                           │  │
//! │  │  TerminalAgent ──► TerminalCache (confirmed + optimistic)        │  │
//! │  │      │                                                           │  │
//! │  │      ├──► HallGateway (actions, PIN) over REST                  │  │
//! │  │      └──► ElevationQueue (parked actions, expiry)                │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`protocol`] - Frames on the event channel
//! - [`hub`] - Server side: WebSocket fan-out with floor-plan rooms
//! - [`transport`] - Terminal side: WebSocket client with reconnection
//! - [`cache`] - Terminal view reducer with optimistic overlays
//! - [`agent`] - Terminal orchestrator and UI handle
//! - [`elevation`] - Actions parked behind a manager PIN
//! - [`gateway`] - Request/response calls to the hall server
//! - [`config`] - Terminal configuration
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cue_sync::{TerminalAgent, TerminalConfig};
//!
//! let config = TerminalConfig::load_or_default(None);
//! let terminal = TerminalAgent::new(config, gateway).start()?;
//!
//! for table in terminal.tables_in_room("main").await {
//!     println!("{} is {}", table.name, table.status);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod cache;
pub mod config;
pub mod elevation;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod protocol;
pub mod transport;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{NoOpEmitter, TerminalAgent, TerminalEventEmitter, TerminalHandle, TerminalStatus};
pub use cache::{Notice, TerminalCache, TerminalEvent};
pub use config::TerminalConfig;
pub use elevation::{ElevationHandle, PendingElevation};
pub use error::{SyncError, SyncResult};
pub use gateway::{HallGateway, RejectionBody, RestGateway};
pub use hub::{HubBackend, HubConfig, HubHandle, RoomSet};
pub use protocol::{EntityUpdate, SnapshotPayload, SyncMessage};
pub use transport::ConnectionState;
