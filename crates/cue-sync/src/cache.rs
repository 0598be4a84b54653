//! # Terminal Cache
//!
//! The terminal's authoritative client-side view, driven by one reducer over
//! [`TerminalEvent`]. Hub frames, local action results and timers all become
//! events; nothing else mutates the cache.
//!
//! ## Optimistic Reconcile
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ActionIssued(pause T3)                                                │
//! │       │  predict with the same transitions the server runs            │
//! │       ▼                                                                 │
//! │  overlay { table: paused, guessed_revision: confirmed + 1 }            │
//! │       │                                                                 │
//! │       ├── table_updated rev < guess ──► store, keep overlay            │
//! │       │                                                                 │
//! │       ├── table_updated rev ≥ guess ──► store, drop overlay            │
//! │       │        └── server state ≠ overlay ──► notice                   │
//! │       │                                                                 │
//! │       ├── ActionRejected ──► drop overlay, notice (not Unauthorized)   │
//! │       │                                                                 │
//! │       └── ActionTimedOut (not yet accepted) ──► drop overlay, notice   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Updates at or below the revision already held are dropped, so per-entity
//! order is preserved even if a frame is delivered twice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use cue_core::{
    table::ensure_can_start, RejectReason, Session, SessionView, Table, TableAction, TableStatus,
};

use crate::protocol::{EntityUpdate, SnapshotPayload};

// =============================================================================
// Events
// =============================================================================

/// Everything that can change what a terminal shows.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalEvent {
    // From the hub
    Snapshot(SnapshotPayload),
    TableUpdated(EntityUpdate<Table>),
    SessionUpdated(EntityUpdate<Session>),
    LayoutActivated { layout_id: String },
    /// The subscription lost events; a snapshot is required.
    Lagged,
    /// This terminal stopped following a room.
    RoomLeft { room: String },

    // From this terminal
    /// The operator issued `action`; show its predicted outcome now.
    ActionIssued {
        action_id: String,
        action: TableAction,
        at: DateTime<Utc>,
    },
    /// The server accepted the call. The overlay stays until the broadcast.
    ActionAccepted { action_id: String },
    /// The server (or the elevation flow) refused the action.
    ActionRejected {
        table_id: String,
        action_id: Option<String>,
        reason: RejectReason,
        message: String,
    },
    /// The call did not resolve before the deadline.
    ActionTimedOut { action_id: String },

    // Connection
    Connected,
    Disconnected,
}

/// A non-blocking message for the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub table_id: Option<String>,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Debug, Clone)]
struct Optimistic {
    action_id: String,
    table: Table,
    session: Option<Session>,
    guessed_revision: i64,
    accepted: bool,
}

// =============================================================================
// Cache
// =============================================================================

/// Client-side view of tables and sessions.
///
/// There is no "selected table" here: views pass the table id they render.
#[derive(Debug, Default)]
pub struct TerminalCache {
    tables: HashMap<String, Table>,
    sessions: HashMap<String, Session>,
    optimistic: HashMap<String, Optimistic>,
    active_layout: Option<String>,
    notices: Vec<Notice>,
    connected: bool,
    needs_snapshot: bool,
}

impl TerminalCache {
    pub fn new() -> Self {
        TerminalCache {
            needs_snapshot: true,
            ..Default::default()
        }
    }

    /// Applies one event. Returns true when anything visible changed.
    pub fn apply(&mut self, event: TerminalEvent) -> bool {
        match event {
            TerminalEvent::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            TerminalEvent::TableUpdated(update) => self.apply_table(update),
            TerminalEvent::SessionUpdated(update) => self.apply_session(update),
            TerminalEvent::LayoutActivated { layout_id } => {
                self.active_layout = Some(layout_id);
                true
            }
            TerminalEvent::Lagged => {
                self.needs_snapshot = true;
                false
            }
            TerminalEvent::RoomLeft { room } => self.forget_room(&room),
            TerminalEvent::ActionIssued { action_id, action, at } => {
                self.apply_optimistic(action_id, &action, at)
            }
            TerminalEvent::ActionAccepted { action_id } => {
                if let Some(overlay) = self.optimistic.values_mut().find(|o| o.action_id == action_id) {
                    overlay.accepted = true;
                }
                false
            }
            TerminalEvent::ActionRejected {
                table_id,
                action_id,
                reason,
                message,
            } => self.reject(table_id, action_id, reason, message),
            TerminalEvent::ActionTimedOut { action_id } => self.time_out(&action_id),
            TerminalEvent::Connected => {
                self.connected = true;
                self.needs_snapshot = true;
                true
            }
            TerminalEvent::Disconnected => {
                self.connected = false;
                true
            }
        }
    }

    // =========================================================================
    // Hub updates
    // =========================================================================

    fn apply_snapshot(&mut self, snapshot: SnapshotPayload) -> bool {
        let mut tables = HashMap::with_capacity(snapshot.tables.len());
        for table in snapshot.tables {
            let newer = self
                .tables
                .remove(&table.id)
                .filter(|held| held.revision > table.revision);
            tables.insert(table.id.clone(), newer.unwrap_or(table));
        }

        let mut sessions = HashMap::with_capacity(snapshot.sessions.len());
        for session in snapshot.sessions {
            let newer = self
                .sessions
                .remove(&session.id)
                .filter(|held| held.revision > session.revision);
            sessions.insert(session.id.clone(), newer.unwrap_or(session));
        }

        self.tables = tables;
        self.sessions = sessions;
        if snapshot.active_layout.is_some() {
            self.active_layout = snapshot.active_layout;
        }
        self.needs_snapshot = false;

        let resolved: Vec<String> = self
            .optimistic
            .iter()
            .filter(|(id, o)| {
                self.tables
                    .get(*id)
                    .map_or(true, |t| t.revision >= o.guessed_revision)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for table_id in resolved {
            self.settle_overlay(&table_id);
        }

        debug!(tables = self.tables.len(), sessions = self.sessions.len(), "Snapshot applied");
        true
    }

    fn apply_table(&mut self, update: EntityUpdate<Table>) -> bool {
        if let Some(held) = self.tables.get(&update.entity_id) {
            if update.server_revision <= held.revision {
                debug!(table_id = %update.entity_id, revision = update.server_revision, "Stale table update dropped");
                return false;
            }
            if held.current_session != update.new_state.current_session {
                if let Some(previous) = &held.current_session {
                    self.sessions.remove(previous);
                }
            }
        }

        let table_id = update.entity_id.clone();
        let mut table = update.new_state;
        table.revision = update.server_revision;
        if table.deleted {
            self.tables.remove(&table_id);
        } else {
            self.tables.insert(table_id.clone(), table);
        }

        let reached = self
            .optimistic
            .get(&table_id)
            .is_some_and(|o| update.server_revision >= o.guessed_revision);
        if reached {
            self.settle_overlay(&table_id);
        }
        true
    }

    fn apply_session(&mut self, update: EntityUpdate<Session>) -> bool {
        if let Some(held) = self.sessions.get(&update.entity_id) {
            if update.server_revision <= held.revision {
                return false;
            }
        }
        let mut session = update.new_state;
        session.revision = update.server_revision;
        self.sessions.insert(update.entity_id, session);
        true
    }

    fn forget_room(&mut self, room: &str) -> bool {
        let gone: Vec<Table> = self
            .tables
            .values()
            .filter(|t| t.room == room)
            .cloned()
            .collect();
        for table in &gone {
            self.tables.remove(&table.id);
            self.optimistic.remove(&table.id);
            if let Some(session_id) = &table.current_session {
                self.sessions.remove(session_id);
            }
        }
        !gone.is_empty()
    }

    /// Drops the overlay for `table_id` now that the server has spoken,
    /// with a notice if the server disagrees with the prediction.
    fn settle_overlay(&mut self, table_id: &str) {
        let Some(overlay) = self.optimistic.remove(table_id) else {
            return;
        };

        let server = self.tables.get(table_id);
        let agrees = server.is_some_and(|t| t.status == overlay.table.status && t.deleted == overlay.table.deleted)
            || (server.is_none() && overlay.table.deleted);
        if !agrees {
            let name = server.map_or(overlay.table.name.as_str(), |t| t.name.as_str());
            self.notices.push(Notice {
                table_id: Some(table_id.to_string()),
                reason: RejectReason::Conflict,
                message: format!("{name} changed on the server"),
            });
        }
    }

    // =========================================================================
    // Local actions
    // =========================================================================

    fn apply_optimistic(&mut self, action_id: String, action: &TableAction, at: DateTime<Utc>) -> bool {
        let Some(confirmed) = self.tables.get(action.table_id()) else {
            return false;
        };
        let mut table = confirmed.clone();
        let mut session = table
            .current_session
            .as_ref()
            .and_then(|id| self.sessions.get(id))
            .cloned();

        let predicted = match action {
            TableAction::Start { .. } => ensure_can_start(&table).map(|_| {
                table.status = TableStatus::Occupied;
                table.updated_at = at;
            }),
            TableAction::Pause { reason, .. } => {
                with_session(&mut session, |s| s.pause(at, reason.clone()))
            }
            TableAction::Resume { .. } => with_session(&mut session, |s| s.resume(at)),
            TableAction::End { .. } => with_session(&mut session, |s| s.end(at).map(|_| ())),
            TableAction::Finalize { .. } => {
                with_session(&mut session, |s| s.finalize(at).map(|_| ()))
            }
            TableAction::Clean { .. } => table.clean(session.as_ref(), at),
            TableAction::Delete { .. } => table.delete(at),
        };

        if let Err(e) = predicted {
            // Let the server give the authoritative answer.
            debug!(table_id = %table.id, error = %e, "No optimistic prediction");
            return false;
        }

        let session_driven = matches!(
            action,
            TableAction::Pause { .. } | TableAction::Resume { .. } | TableAction::End { .. } | TableAction::Finalize { .. }
        );
        if session_driven {
            if let Some(s) = &mut session {
                table.follow_session(s, at);
                s.revision += 1;
            }
        }

        let guessed_revision = table.revision + 1;
        table.revision = guessed_revision;
        self.optimistic.insert(
            table.id.clone(),
            Optimistic {
                action_id,
                table,
                session,
                guessed_revision,
                accepted: false,
            },
        );
        true
    }

    fn reject(
        &mut self,
        table_id: String,
        action_id: Option<String>,
        reason: RejectReason,
        message: String,
    ) -> bool {
        let matches_overlay = self
            .optimistic
            .get(&table_id)
            .is_some_and(|o| action_id.as_deref().map_or(true, |id| id == o.action_id));
        if matches_overlay {
            self.optimistic.remove(&table_id);
        }

        // Elevation is a prompt, not an error.
        if reason != RejectReason::Unauthorized {
            self.notices.push(Notice {
                table_id: Some(table_id),
                reason,
                message,
            });
        }
        true
    }

    fn time_out(&mut self, action_id: &str) -> bool {
        let expired = self
            .optimistic
            .iter()
            .find(|(_, o)| o.action_id == action_id && !o.accepted)
            .map(|(id, _)| id.clone());

        match expired {
            Some(table_id) => {
                self.optimistic.remove(&table_id);
                self.notices.push(Notice {
                    table_id: Some(table_id),
                    reason: RejectReason::Timeout,
                    message: "No answer from the server; showing last confirmed state".into(),
                });
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// The table as the operator should see it (prediction first).
    pub fn table(&self, table_id: &str) -> Option<&Table> {
        self.optimistic
            .get(table_id)
            .map(|o| &o.table)
            .or_else(|| self.tables.get(table_id))
    }

    /// The last state the server confirmed.
    pub fn confirmed_table(&self, table_id: &str) -> Option<&Table> {
        self.tables.get(table_id)
    }

    /// The session attached to a table (prediction first).
    pub fn session_for_table(&self, table_id: &str) -> Option<&Session> {
        if let Some(session) = self.optimistic.get(table_id).and_then(|o| o.session.as_ref()) {
            return Some(session);
        }
        let table = self.table(table_id)?;
        table.current_session.as_ref().and_then(|id| self.sessions.get(id))
    }

    /// Rendered session, with the running amount computed locally.
    pub fn session_view(&self, table_id: &str, now: DateTime<Utc>) -> Option<SessionView> {
        self.session_for_table(table_id).map(|s| SessionView::at(s, now))
    }

    /// True while an action on this table awaits the server.
    pub fn is_pending(&self, table_id: &str) -> bool {
        self.optimistic.contains_key(table_id)
    }

    /// Tables in a room (or every room for `*`), sorted by name.
    pub fn tables_in_room(&self, room: &str) -> Vec<&Table> {
        let mut tables: Vec<&Table> = self
            .tables
            .keys()
            .filter_map(|id| self.table(id))
            .filter(|t| room == cue_core::ALL_ROOMS || t.room == room)
            .collect();
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        tables
    }

    pub fn active_layout(&self) -> Option<&str> {
        self.active_layout.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn needs_snapshot(&self) -> bool {
        self.needs_snapshot
    }

    /// Takes the notices accumulated since the last call.
    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }
}

fn with_session<F>(session: &mut Option<Session>, f: F) -> cue_core::CoreResult<()>
where
    F: FnOnce(&mut Session) -> cue_core::CoreResult<()>,
{
    match session {
        Some(s) => f(s),
        None => Err(cue_core::CoreError::not_found("session", "current")),
    }
}
