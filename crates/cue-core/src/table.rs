//! # Table Status Rules
//!
//! Pure guards and transitions for the table registry. Only two kinds of
//! callers may move a table's status: a committed session transition
//! ([`Table::follow_session`]) and the explicit manual actions below
//! (`clean`, maintenance toggle, delete).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Session, SessionStatus, Table, TableStatus};
use crate::validation;

/// Rejects a start unless the table is free.
pub fn ensure_can_start(table: &Table) -> CoreResult<()> {
    if table.deleted {
        return Err(CoreError::not_found("table", &table.id));
    }
    if table.status != TableStatus::Available || table.current_session.is_some() {
        return Err(CoreError::conflict(
            "table",
            &table.id,
            format!("table is {}", table.status),
        ));
    }
    Ok(())
}

impl Table {
    /// Creates a new available table.
    pub fn new(
        name: &str,
        capacity: u32,
        room: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Table> {
        validation::validate_table_name(name)?;
        validation::validate_capacity(capacity)?;
        validation::validate_room(room)?;

        Ok(Table {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            capacity,
            room: room.trim().to_string(),
            status: TableStatus::Available,
            current_session: None,
            deleted: false,
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Mirrors a committed session transition onto the table.
    pub fn follow_session(&mut self, session: &Session, now: DateTime<Utc>) {
        self.status = session.status.table_status();
        self.current_session = Some(session.id.clone());
        self.updated_at = now;
    }

    /// cleaning → available, once the held session is settled.
    ///
    /// `session` is the session referenced by `current_session`, if any.
    pub fn clean(&mut self, session: Option<&Session>, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != TableStatus::Cleaning {
            return Err(CoreError::invalid_transition("table", &self.id, self.status, "clean"));
        }
        if let Some(session) = session {
            if !matches!(session.status, SessionStatus::Ended | SessionStatus::Finalized) {
                return Err(CoreError::invalid_transition(
                    "table",
                    &self.id,
                    format!("session {} is {}", session.id, session.status),
                    "clean",
                ));
            }
        }

        self.status = TableStatus::Available;
        self.current_session = None;
        self.updated_at = now;
        Ok(())
    }

    /// available ↔ maintenance.
    pub fn set_maintenance(&mut self, on: bool, now: DateTime<Utc>) -> CoreResult<()> {
        let (from, to) = if on {
            (TableStatus::Available, TableStatus::Maintenance)
        } else {
            (TableStatus::Maintenance, TableStatus::Available)
        };
        if self.status != from {
            let action = if on { "start maintenance on" } else { "end maintenance on" };
            return Err(CoreError::invalid_transition("table", &self.id, self.status, action));
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Soft delete. Refused while a session holds the table.
    pub fn delete(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.deleted {
            return Err(CoreError::not_found("table", &self.id));
        }
        if self.current_session.is_some()
            || matches!(self.status, TableStatus::Occupied | TableStatus::Paused)
        {
            return Err(CoreError::conflict(
                "table",
                &self.id,
                format!("table is {}", self.status),
            ));
        }

        self.deleted = true;
        self.updated_at = now;
        Ok(())
    }

    /// Renames or resizes the table.
    pub fn update(&mut self, name: Option<&str>, capacity: Option<u32>, now: DateTime<Utc>) -> CoreResult<()> {
        if let Some(name) = name {
            validation::validate_table_name(name)?;
        }
        if let Some(capacity) = capacity {
            validation::validate_capacity(capacity)?;
        }

        if let Some(name) = name {
            self.name = name.trim().to_string();
        }
        if let Some(capacity) = capacity {
            self.capacity = capacity;
        }
        self.updated_at = now;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
