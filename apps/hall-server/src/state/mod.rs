//! Server-side state: the floor and the services that change it.
//!
//! - [`floor`] - In-memory floor, table leases, commit pipeline
//! - [`registry`] - Table registry (create, clean, maintenance, delete)
//! - [`sessions`] - Session state machine
//! - [`guard`] - Elevation, PIN verification, pending actions
//! - [`backend`] - Hub seam (tokens, snapshots)

pub mod backend;
pub mod floor;
pub mod guard;
pub mod registry;
pub mod sessions;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use cue_core::{Session, SessionView, Table};

pub use backend::FloorBackend;
pub use floor::{Floor, FloorState, TableLease};
pub use guard::{AccessGuard, PendingAction, Verification};
pub use registry::TableRegistry;
pub use sessions::SessionManager;

/// What a table action returns: the committed table and its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub table: Table,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
}

impl ActionResult {
    pub fn new(table: Table, session: Option<&Session>) -> Self {
        ActionResult {
            table,
            session: session.map(|s| SessionView::at(s, Utc::now())),
        }
    }
}
