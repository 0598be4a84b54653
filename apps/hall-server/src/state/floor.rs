//! # Floor State and Commit Pipeline
//!
//! The in-memory view of every live table and attached session, and the one
//! path by which it changes.
//!
//! ## Commit Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  lease(table)          one writer per table; busy ──► Conflict          │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  read + transition     pure cue-core functions on cloned entities      │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  commit                                                                 │
//! │   1. bump revisions    table and session                               │
//! │   2. persist           one SQLite transaction, bounded by timeout      │
//! │   3. swap              single write section on the RwLock              │
//! │   4. publish           session_updated, then table_updated             │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  drop lease            also on early return or cancellation             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed persist leaves memory untouched, so readers never see a change
//! the database does not hold.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, info};

use cue_core::{CoreError, Session, Table, Tariff};
use cue_db::{Database, DbResult};
use cue_sync::{HubHandle, SyncMessage};

use crate::error::{ApiError, ApiResult};

// =============================================================================
// Floor State
// =============================================================================

/// Live tables (deleted ones excluded) and the sessions they hold.
#[derive(Debug, Default, Clone)]
pub struct FloorState {
    pub tables: HashMap<String, Table>,
    pub sessions: HashMap<String, Session>,
    pub tariffs: HashMap<String, Tariff>,
    pub active_layout: Option<String>,
}

impl FloorState {
    /// Loads the live floor from the database.
    pub async fn load(db: &Database) -> DbResult<Self> {
        let tables: HashMap<_, _> = db
            .tables()
            .list()
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let mut held = db.sessions().open_sessions().await?;
        held.extend(db.sessions().unreleased_sessions().await?);

        let sessions = held
            .into_iter()
            .filter(|s| {
                tables
                    .get(&s.table_id)
                    .is_some_and(|t| t.current_session.as_deref() == Some(s.id.as_str()))
            })
            .map(|s| (s.id.clone(), s))
            .collect();

        let tariffs = db
            .tariffs()
            .list()
            .await?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        Ok(FloorState {
            tables,
            sessions,
            tariffs,
            active_layout: None,
        })
    }

    /// The session a table currently holds.
    pub fn session_of(&self, table: &Table) -> Option<&Session> {
        table
            .current_session
            .as_deref()
            .and_then(|id| self.sessions.get(id))
    }

    /// Tables ordered by room, then name.
    pub fn sorted_tables(&self) -> Vec<Table> {
        let mut tables: Vec<Table> = self.tables.values().cloned().collect();
        tables.sort_by(|a, b| a.room.cmp(&b.room).then_with(|| a.name.cmp(&b.name)));
        tables
    }
}

// =============================================================================
// Table Leases
// =============================================================================

/// Exclusive right to mutate one table. Released on drop.
#[derive(Debug)]
pub struct TableLease {
    leases: Arc<Mutex<HashSet<String>>>,
    table_id: String,
}

impl TableLease {
    pub fn table_id(&self) -> &str {
        &self.table_id
    }
}

impl Drop for TableLease {
    fn drop(&mut self) {
        match self.leases.lock() {
            Ok(mut held) => {
                held.remove(&self.table_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.table_id);
            }
        }
    }
}

// =============================================================================
// Floor
// =============================================================================

/// Owns the floor state and serializes every write to it.
pub struct Floor {
    db: Database,
    hub: HubHandle,
    state: Arc<RwLock<FloorState>>,
    leases: Arc<Mutex<HashSet<String>>>,
    action_timeout: Duration,
}

impl Floor {
    pub fn new(db: Database, hub: HubHandle, state: Arc<RwLock<FloorState>>, action_timeout: Duration) -> Self {
        Floor {
            db,
            hub,
            state,
            leases: Arc::new(Mutex::new(HashSet::new())),
            action_timeout,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, FloorState> {
        self.state.read().await
    }

    /// Takes the single-writer lease on `table_id`.
    ///
    /// A second action on a table whose first is still in flight is rejected
    /// with `Conflict`, never queued.
    pub fn lease(&self, table_id: &str) -> Result<TableLease, CoreError> {
        let mut held = self
            .leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !held.insert(table_id.to_string()) {
            debug!(table_id, "Table lease busy");
            return Err(CoreError::conflict(
                "table",
                table_id,
                "another action on this table is in progress",
            ));
        }

        Ok(TableLease {
            leases: self.leases.clone(),
            table_id: table_id.to_string(),
        })
    }

    /// Live table by id, or `NotFound`.
    pub async fn table(&self, table_id: &str) -> Result<Table, CoreError> {
        self.read()
            .await
            .tables
            .get(table_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("table", table_id))
    }

    /// Commits a table change, and the session it holds when given.
    ///
    /// Returns the committed entities with their new revisions.
    pub async fn commit(
        &self,
        lease: &TableLease,
        mut table: Table,
        mut session: Option<Session>,
    ) -> ApiResult<(Table, Option<Session>)> {
        debug_assert_eq!(lease.table_id(), table.id);

        table.revision += 1;
        if let Some(session) = session.as_mut() {
            session.revision += 1;
        }

        self.persist(self.db.sessions().commit(&table, session.as_ref()))
            .await?;

        {
            let mut floor = self.state.write().await;
            let previous = floor
                .tables
                .get(&table.id)
                .and_then(|t| t.current_session.clone());
            if let Some(previous) = previous {
                if table.current_session.as_deref() != Some(previous.as_str()) {
                    floor.sessions.remove(&previous);
                }
            }
            if let Some(session) = &session {
                floor.sessions.insert(session.id.clone(), session.clone());
            }
            if table.deleted {
                floor.tables.remove(&table.id);
            } else {
                floor.tables.insert(table.id.clone(), table.clone());
            }
        }

        if let Some(session) = &session {
            self.hub.publish(SyncMessage::session_updated(session, &table.room));
        }
        self.hub.publish(SyncMessage::table_updated(&table));

        info!(
            table_id = %table.id,
            status = %table.status,
            revision = table.revision,
            session_id = session.as_ref().map(|s| s.id.as_str()).unwrap_or("-"),
            "Committed table change"
        );
        Ok((table, session))
    }

    /// Commits a change to a session alone (charges, discounts, or a late
    /// finalize of a session its table already released).
    pub async fn commit_session(&self, lease: &TableLease, mut session: Session, room: &str) -> ApiResult<Session> {
        debug_assert_eq!(lease.table_id(), session.table_id);

        session.revision += 1;
        self.persist(self.db.sessions().save(&session)).await?;

        {
            let mut floor = self.state.write().await;
            if let Some(held) = floor.sessions.get_mut(&session.id) {
                *held = session.clone();
            }
        }

        self.hub.publish(SyncMessage::session_updated(&session, room));
        info!(
            session_id = %session.id,
            status = %session.status,
            revision = session.revision,
            "Committed session change"
        );
        Ok(session)
    }

    /// Stores a tariff definition. Running sessions keep their snapshot.
    pub async fn save_tariff(&self, tariff: Tariff) -> ApiResult<Tariff> {
        self.persist(self.db.tariffs().save(&tariff)).await?;
        self.state
            .write()
            .await
            .tariffs
            .insert(tariff.id.clone(), tariff.clone());
        info!(tariff_id = %tariff.id, name = %tariff.name, "Saved tariff");
        Ok(tariff)
    }

    /// Marks a floor plan active and tells every terminal.
    pub async fn activate_layout(&self, layout_id: &str) {
        self.state.write().await.active_layout = Some(layout_id.to_string());
        self.hub.publish(SyncMessage::LayoutActivated {
            layout_id: layout_id.to_string(),
        });
        info!(layout_id, "Activated layout");
    }

    async fn persist<F>(&self, write: F) -> ApiResult<()>
    where
        F: std::future::Future<Output = DbResult<()>>,
    {
        match tokio::time::timeout(self.action_timeout, write).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::Timeout(self.action_timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cue_core::TableStatus;
    use cue_sync::{HubBackend, HubConfig, SnapshotPayload, SyncResult};
    use cue_sync::protocol::HelloPayload;
    use futures_util::future::{BoxFuture, FutureExt};

    struct NoBackend;

    impl HubBackend for NoBackend {
        fn authenticate(&self, _hello: &HelloPayload) -> SyncResult<()> {
            Ok(())
        }

        fn snapshot(&self) -> BoxFuture<'_, SyncResult<SnapshotPayload>> {
            async move {
                Ok(SnapshotPayload {
                    tables: Vec::new(),
                    sessions: Vec::new(),
                    active_layout: None,
                    server_time: Utc::now(),
                })
            }
            .boxed()
        }
    }

    async fn floor() -> Floor {
        let db = Database::new(cue_db::DbConfig::in_memory()).await.unwrap();
        let hub = HubHandle::new(HubConfig::default(), Arc::new(NoBackend));
        Floor::new(db, hub, Arc::new(RwLock::new(FloorState::default())), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_lease_is_exclusive_until_dropped() {
        let floor = floor().await;

        let lease = floor.lease("t1").unwrap();
        assert!(matches!(floor.lease("t1"), Err(CoreError::Conflict { .. })));
        assert!(floor.lease("t2").is_ok());

        drop(lease);
        assert!(floor.lease("t1").is_ok());
    }

    #[tokio::test]
    async fn test_commit_bumps_revision_and_publishes() {
        let floor = floor().await;
        let mut events = floor.hub().subscribe();

        let table = Table::new("Table 1", 4, "main", Utc::now()).unwrap();
        let lease = floor.lease(&table.id).unwrap();
        let (committed, _) = floor.commit(&lease, table.clone(), None).await.unwrap();

        assert_eq!(committed.revision, 1);
        assert_eq!(floor.table(&table.id).await.unwrap().revision, 1);
        assert!(floor.db().tables().get(&table.id).await.unwrap().is_some());

        match events.recv().await.unwrap() {
            SyncMessage::TableUpdated(update) => {
                assert_eq!(update.entity_id, table.id);
                assert_eq!(update.server_revision, 1);
                assert_eq!(update.new_state.status, TableStatus::Available);
            }
            other => panic!("Expected table_updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deleted_table_leaves_floor() {
        let floor = floor().await;
        let now = Utc::now();

        let table = Table::new("Table 1", 4, "main", now).unwrap();
        let lease = floor.lease(&table.id).unwrap();
        let (mut table, _) = floor.commit(&lease, table, None).await.unwrap();

        table.delete(now).unwrap();
        floor.commit(&lease, table.clone(), None).await.unwrap();

        assert!(matches!(floor.table(&table.id).await, Err(CoreError::NotFound { .. })));
        assert!(floor.db().tables().list().await.unwrap().is_empty());
    }
}
