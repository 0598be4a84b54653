//! # Table Repository
//!
//! Persistence for physical tables. Deletes are soft: the row stays so
//! session history keeps its foreign key.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteExecutor;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use cue_core::{Table, TableStatus};

#[derive(Debug, sqlx::FromRow)]
struct TableRow {
    id: String,
    name: String,
    capacity: i64,
    room: String,
    status: TableStatus,
    current_session_id: Option<String>,
    deleted: bool,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<TableRow> for Table {
    fn from(row: TableRow) -> Self {
        Table {
            id: row.id,
            name: row.name,
            capacity: row.capacity.max(0) as u32,
            room: row.room,
            status: row.status,
            current_session: row.current_session_id,
            deleted: row.deleted,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SELECT_TABLE: &str = r#"
    SELECT id, name, capacity, room, status, current_session_id,
           deleted, revision, created_at, updated_at
    FROM tables
"#;

/// Repository for table operations.
#[derive(Debug, Clone)]
pub struct TableRepository {
    pool: SqlitePool,
}

impl TableRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TableRepository { pool }
    }

    /// Lists tables that are not deleted, by room then name.
    pub async fn list(&self) -> DbResult<Vec<Table>> {
        let rows: Vec<TableRow> =
            sqlx::query_as(&format!("{SELECT_TABLE} WHERE deleted = 0 ORDER BY room, name"))
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(Table::from).collect())
    }

    /// Gets a table by ID, including soft-deleted ones.
    pub async fn get(&self, id: &str) -> DbResult<Option<Table>> {
        let row: Option<TableRow> = sqlx::query_as(&format!("{SELECT_TABLE} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Table::from))
    }

    /// Inserts or updates a table.
    pub async fn save(&self, table: &Table) -> DbResult<()> {
        save_in(&self.pool, table).await
    }
}

/// Upserts `table` on any executor, so it can join a transaction.
pub(crate) async fn save_in<'e, E>(executor: E, table: &Table) -> DbResult<()>
where
    E: SqliteExecutor<'e>,
{
    debug!(table_id = %table.id, status = %table.status, revision = table.revision, "Saving table");

    sqlx::query(
        r#"
        INSERT INTO tables (
            id, name, capacity, room, status, current_session_id,
            deleted, revision, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            capacity = excluded.capacity,
            room = excluded.room,
            status = excluded.status,
            current_session_id = excluded.current_session_id,
            deleted = excluded.deleted,
            revision = excluded.revision,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&table.id)
    .bind(&table.name)
    .bind(table.capacity as i64)
    .bind(&table.room)
    .bind(table.status)
    .bind(&table.current_session)
    .bind(table.deleted)
    .bind(table.revision)
    .bind(table.created_at)
    .bind(table.updated_at)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use chrono::Utc;
    use cue_core::{Table, TableStatus};

    #[tokio::test]
    async fn test_save_and_list_tables() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.tables();

        let mut table = Table::new("Table 1", 4, "main", Utc::now()).unwrap();
        repo.save(&table).await.unwrap();

        table.status = TableStatus::Maintenance;
        table.revision = 2;
        repo.save(&table).await.unwrap();

        let stored = repo.get(&table.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TableStatus::Maintenance);
        assert_eq!(stored.revision, 2);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_tables_are_hidden_from_list() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.tables();

        let mut table = Table::new("Table 9", 2, "bar", Utc::now()).unwrap();
        table.delete(Utc::now()).unwrap();
        repo.save(&table).await.unwrap();

        assert!(repo.list().await.unwrap().is_empty());
        assert!(repo.get(&table.id).await.unwrap().unwrap().deleted);
    }
}
