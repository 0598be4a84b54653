//! # Session Repository
//!
//! Persistence for billing sessions and the table they hold.
//!
//! ## Commit Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SessionManager (hall-server)                                          │
//! │       │ commit(&table, Some(&session))                                 │
//! │       ▼                                                                 │
//! │  BEGIN                                                                  │
//! │    ├── upsert sessions row   ◄── idx_sessions_open_per_table guards   │
//! │    └── upsert tables row         against a second open session        │
//! │  COMMIT                                                                 │
//! │                                                                         │
//! │  Either both rows change or neither does.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteExecutor;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use crate::repository::table;
use cue_core::{Money, Session, SessionStatus, Table};

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: String,
    table_id: String,
    tariff_id: String,
    tariff_snapshot: String,
    status: SessionStatus,
    player_count: i64,
    start_time: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    pause_reason: Option<String>,
    accumulated_paused_ms: i64,
    end_time: Option<DateTime<Utc>>,
    frozen_amount_cents: Option<i64>,
    finalized_at: Option<DateTime<Utc>>,
    charges: String,
    discount: Option<String>,
    notes: Option<String>,
    revision: i64,
}

impl SessionRow {
    fn into_session(self) -> DbResult<Session> {
        let discount = match self.discount {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        };

        Ok(Session {
            id: self.id,
            table_id: self.table_id,
            tariff_id: self.tariff_id,
            tariff: serde_json::from_str(&self.tariff_snapshot)?,
            status: self.status,
            player_count: self.player_count.max(0) as u32,
            start_time: self.start_time,
            paused_at: self.paused_at,
            pause_reason: self.pause_reason,
            accumulated_paused_ms: self.accumulated_paused_ms,
            end_time: self.end_time,
            frozen_amount: self.frozen_amount_cents.map(Money::from_cents),
            finalized_at: self.finalized_at,
            charges: serde_json::from_str(&self.charges)?,
            discount,
            notes: self.notes,
            revision: self.revision,
        })
    }
}

const SELECT_SESSION: &str = r#"
    SELECT id, table_id, tariff_id, tariff_snapshot, status, player_count,
           start_time, paused_at, pause_reason, accumulated_paused_ms,
           end_time, frozen_amount_cents, finalized_at, charges, discount,
           notes, revision
    FROM sessions
"#;

/// Repository for session operations.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SessionRepository { pool }
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_SESSION} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Most recent session on a table, whatever its status.
    pub async fn latest_for_table(&self, table_id: &str) -> DbResult<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_SESSION} WHERE table_id = ?1 ORDER BY start_time DESC LIMIT 1"
        ))
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Sessions still holding their table (active or paused).
    pub async fn open_sessions(&self) -> DbResult<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_SESSION} WHERE status IN ('active', 'paused') ORDER BY start_time"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Sessions that ended or finalized but whose table has not been
    /// cleaned yet. Loaded at startup with the open ones.
    pub async fn unreleased_sessions(&self) -> DbResult<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.table_id, s.tariff_id, s.tariff_snapshot, s.status,
                   s.player_count, s.start_time, s.paused_at, s.pause_reason,
                   s.accumulated_paused_ms, s.end_time, s.frozen_amount_cents,
                   s.finalized_at, s.charges, s.discount, s.notes, s.revision
            FROM sessions s
            JOIN tables t ON t.current_session_id = s.id
            WHERE s.status IN ('ended', 'finalized')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Past sessions of a table, newest first.
    pub async fn history(&self, table_id: &str, limit: u32) -> DbResult<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_SESSION} WHERE table_id = ?1 ORDER BY start_time DESC LIMIT ?2"
        ))
        .bind(table_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    /// Inserts or updates a session on its own.
    pub async fn save(&self, session: &Session) -> DbResult<()> {
        save_in(&self.pool, session).await
    }

    /// Writes a table and (optionally) its session in one transaction.
    ///
    /// The session is written first so a second open session on the same
    /// table fails on the unique index before the table row changes.
    pub async fn commit(&self, table: &Table, session: Option<&Session>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(session) = session {
            save_in(&mut *tx, session).await?;
        }
        table::save_in(&mut *tx, table).await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn save_in<'e, E>(executor: E, session: &Session) -> DbResult<()>
where
    E: SqliteExecutor<'e>,
{
    debug!(
        session_id = %session.id,
        table_id = %session.table_id,
        status = %session.status,
        revision = session.revision,
        "Saving session"
    );

    let tariff_snapshot = serde_json::to_string(&session.tariff)?;
    let charges = serde_json::to_string(&session.charges)?;
    let discount = session
        .discount
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO sessions (
            id, table_id, tariff_id, tariff_snapshot, status, player_count,
            start_time, paused_at, pause_reason, accumulated_paused_ms,
            end_time, frozen_amount_cents, finalized_at, charges, discount,
            notes, revision
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT (id) DO UPDATE SET
            status = excluded.status,
            player_count = excluded.player_count,
            paused_at = excluded.paused_at,
            pause_reason = excluded.pause_reason,
            accumulated_paused_ms = excluded.accumulated_paused_ms,
            end_time = excluded.end_time,
            frozen_amount_cents = excluded.frozen_amount_cents,
            finalized_at = excluded.finalized_at,
            charges = excluded.charges,
            discount = excluded.discount,
            notes = excluded.notes,
            revision = excluded.revision
        "#,
    )
    .bind(&session.id)
    .bind(&session.table_id)
    .bind(&session.tariff_id)
    .bind(tariff_snapshot)
    .bind(session.status)
    .bind(session.player_count as i64)
    .bind(session.start_time)
    .bind(session.paused_at)
    .bind(&session.pause_reason)
    .bind(session.accumulated_paused_ms)
    .bind(session.end_time)
    .bind(session.frozen_amount.map(|m| m.cents()))
    .bind(session.finalized_at)
    .bind(charges)
    .bind(discount)
    .bind(&session.notes)
    .bind(session.revision)
    .execute(executor)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig, DbError};
    use chrono::{Duration, Utc};
    use cue_core::{Discount, Money, RateType, Session, SessionStatus, Table, TableStatus, Tariff};

    fn hourly_tariff() -> Tariff {
        Tariff {
            id: uuid::Uuid::new_v4().to_string(),
            name: "Standard".into(),
            rate: Money::from_cents(1000),
            rate_type: RateType::Hourly,
            free_minutes: 0,
            min_duration_minutes: None,
            max_duration_minutes: None,
            restrictions: Default::default(),
            tiered_rates: Vec::new(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    async fn seeded() -> (Database, Table, Tariff) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let table = Table::new("Table 1", 4, "main", Utc::now()).unwrap();
        let tariff = hourly_tariff();
        db.tables().save(&table).await.unwrap();
        db.tariffs().save(&tariff).await.unwrap();
        (db, table, tariff)
    }

    #[tokio::test]
    async fn test_commit_writes_table_and_session_together() {
        let (db, mut table, tariff) = seeded().await;
        let now = Utc::now();

        let mut session = Session::start(&table, tariff, 2, now).unwrap();
        session.discount = Some(Discount::Percent { bps: 1000 });
        table.follow_session(&session, now);

        db.sessions().commit(&table, Some(&session)).await.unwrap();

        let stored_table = db.tables().get(&table.id).await.unwrap().unwrap();
        assert_eq!(stored_table.status, TableStatus::Occupied);
        assert_eq!(stored_table.current_session.as_deref(), Some(session.id.as_str()));

        let stored = db.sessions().get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        assert_eq!(stored.tariff.rate, Money::from_cents(1000));
        assert_eq!(stored.discount, Some(Discount::Percent { bps: 1000 }));
        assert_eq!(db.sessions().open_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_open_session_is_rejected_and_rolled_back() {
        let (db, mut table, tariff) = seeded().await;
        let now = Utc::now();

        let first = Session::start(&table, tariff.clone(), 2, now).unwrap();
        table.follow_session(&first, now);
        db.sessions().commit(&table, Some(&first)).await.unwrap();

        // Bypass the in-memory guard to hit the index directly.
        let mut fresh = table.clone();
        fresh.status = TableStatus::Available;
        fresh.current_session = None;
        let second = Session::start(&fresh, tariff, 2, now).unwrap();
        fresh.follow_session(&second, now);

        let err = db.sessions().commit(&fresh, Some(&second)).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));

        let stored_table = db.tables().get(&table.id).await.unwrap().unwrap();
        assert_eq!(stored_table.current_session.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let (db, mut table, tariff) = seeded().await;
        let t0 = Utc::now() - Duration::hours(3);

        for offset in 0..3 {
            let start = t0 + Duration::hours(offset);
            let mut session = Session::start(&table, tariff.clone(), 1, start).unwrap();
            session.end(start + Duration::minutes(30)).unwrap();
            table.follow_session(&session, start);
            db.sessions().commit(&table, Some(&session)).await.unwrap();

            table.clean(Some(&session), start + Duration::minutes(31)).unwrap();
            db.tables().save(&table).await.unwrap();
        }

        let history = db.sessions().history(&table.id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].start_time > history[1].start_time);
        assert_eq!(history[0].frozen_amount, Some(Money::from_cents(500)));

        let latest = db.sessions().latest_for_table(&table.id).await.unwrap().unwrap();
        assert_eq!(latest.id, history[0].id);
        assert!(db.sessions().unreleased_sessions().await.unwrap().is_empty());
    }
}
