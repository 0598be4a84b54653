//! Table registry: the canonical set of tables.
//!
//! Status moves here only through the manual actions (clean, maintenance,
//! delete). Session transitions move it through [`Table::follow_session`]
//! inside the session manager's commit.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use cue_core::{CoreError, Table};

use crate::error::ApiResult;
use crate::state::floor::Floor;
use crate::state::ActionResult;

pub struct TableRegistry {
    floor: Arc<Floor>,
}

impl TableRegistry {
    pub fn new(floor: Arc<Floor>) -> Self {
        TableRegistry { floor }
    }

    pub async fn list(&self) -> Vec<Table> {
        self.floor.read().await.sorted_tables()
    }

    pub async fn get(&self, table_id: &str) -> ApiResult<Table> {
        Ok(self.floor.table(table_id).await?)
    }

    pub async fn create(&self, name: &str, capacity: u32, room: &str) -> ApiResult<Table> {
        let table = Table::new(name, capacity, room, Utc::now())?;
        let lease = self.floor.lease(&table.id)?;
        let (table, _) = self.floor.commit(&lease, table, None).await?;
        info!(table_id = %table.id, name = %table.name, room = %table.room, "Table created");
        Ok(table)
    }

    pub async fn update(&self, table_id: &str, name: Option<&str>, capacity: Option<u32>) -> ApiResult<Table> {
        let lease = self.floor.lease(table_id)?;
        let mut table = self.floor.table(table_id).await?;
        table.update(name, capacity, Utc::now())?;
        let (table, _) = self.floor.commit(&lease, table, None).await?;
        Ok(table)
    }

    /// Soft delete. `Conflict` while a session holds the table.
    pub async fn delete(&self, table_id: &str) -> ApiResult<ActionResult> {
        let lease = self.floor.lease(table_id)?;
        let mut table = self.floor.table(table_id).await?;
        table.delete(Utc::now())?;
        let (table, _) = self.floor.commit(&lease, table, None).await?;
        info!(table_id, "Table deleted");
        Ok(ActionResult::new(table, None))
    }

    /// available ↔ maintenance.
    pub async fn set_maintenance(&self, table_id: &str, on: bool) -> ApiResult<Table> {
        let lease = self.floor.lease(table_id)?;
        let mut table = self.floor.table(table_id).await?;
        table.set_maintenance(on, Utc::now())?;
        let (table, _) = self.floor.commit(&lease, table, None).await?;
        info!(table_id, maintenance = on, "Maintenance toggled");
        Ok(table)
    }

    /// cleaning → available, once the held session is settled. The session
    /// itself is kept for history.
    pub async fn clean(&self, table_id: &str) -> ApiResult<ActionResult> {
        let lease = self.floor.lease(table_id)?;
        let (mut table, session) = {
            let floor = self.floor.read().await;
            let table = floor
                .tables
                .get(table_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("table", table_id))?;
            let session = floor.session_of(&table).cloned();
            (table, session)
        };

        table.clean(session.as_ref(), Utc::now())?;
        let (table, _) = self.floor.commit(&lease, table, None).await?;
        info!(table_id, "Table cleaned");
        Ok(ActionResult::new(table, None))
    }

    pub async fn activate_layout(&self, layout_id: &str) {
        self.floor.activate_layout(layout_id).await;
    }
}
