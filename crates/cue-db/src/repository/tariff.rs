//! # Tariff Repository
//!
//! Persistence for pricing policies. Restrictions and tier bands are
//! stored as JSON columns; a running session never reads from here, it
//! carries its own snapshot.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use cue_core::{Money, RateType, Tariff};

#[derive(Debug, sqlx::FromRow)]
struct TariffRow {
    id: String,
    name: String,
    rate_cents: i64,
    rate_type: RateType,
    free_minutes: i64,
    min_duration_minutes: Option<i64>,
    max_duration_minutes: Option<i64>,
    restrictions: String,
    tiered_rates: String,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TariffRow {
    fn into_tariff(self) -> DbResult<Tariff> {
        Ok(Tariff {
            id: self.id,
            name: self.name,
            rate: Money::from_cents(self.rate_cents),
            rate_type: self.rate_type,
            free_minutes: self.free_minutes.max(0) as u32,
            min_duration_minutes: self.min_duration_minutes.map(|m| m.max(0) as u32),
            max_duration_minutes: self.max_duration_minutes.map(|m| m.max(0) as u32),
            restrictions: serde_json::from_str(&self.restrictions)?,
            tiered_rates: serde_json::from_str(&self.tiered_rates)?,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_TARIFF: &str = r#"
    SELECT id, name, rate_cents, rate_type, free_minutes,
           min_duration_minutes, max_duration_minutes,
           restrictions, tiered_rates, is_active, created_at, updated_at
    FROM tariffs
"#;

/// Repository for tariff operations.
#[derive(Debug, Clone)]
pub struct TariffRepository {
    pool: SqlitePool,
}

impl TariffRepository {
    pub fn new(pool: SqlitePool) -> Self {
        TariffRepository { pool }
    }

    /// Lists all tariffs, active first.
    pub async fn list(&self) -> DbResult<Vec<Tariff>> {
        let rows: Vec<TariffRow> =
            sqlx::query_as(&format!("{SELECT_TARIFF} ORDER BY is_active DESC, name"))
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(TariffRow::into_tariff).collect()
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<Tariff>> {
        let row: Option<TariffRow> = sqlx::query_as(&format!("{SELECT_TARIFF} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TariffRow::into_tariff).transpose()
    }

    /// Inserts or updates a tariff.
    pub async fn save(&self, tariff: &Tariff) -> DbResult<()> {
        debug!(tariff_id = %tariff.id, name = %tariff.name, "Saving tariff");

        let restrictions = serde_json::to_string(&tariff.restrictions)?;
        let tiered_rates = serde_json::to_string(&tariff.tiered_rates)?;

        sqlx::query(
            r#"
            INSERT INTO tariffs (
                id, name, rate_cents, rate_type, free_minutes,
                min_duration_minutes, max_duration_minutes,
                restrictions, tiered_rates, is_active, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                rate_cents = excluded.rate_cents,
                rate_type = excluded.rate_type,
                free_minutes = excluded.free_minutes,
                min_duration_minutes = excluded.min_duration_minutes,
                max_duration_minutes = excluded.max_duration_minutes,
                restrictions = excluded.restrictions,
                tiered_rates = excluded.tiered_rates,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&tariff.id)
        .bind(&tariff.name)
        .bind(tariff.rate.cents())
        .bind(tariff.rate_type)
        .bind(tariff.free_minutes as i64)
        .bind(tariff.min_duration_minutes.map(i64::from))
        .bind(tariff.max_duration_minutes.map(i64::from))
        .bind(restrictions)
        .bind(tiered_rates)
        .bind(tariff.is_active)
        .bind(tariff.created_at)
        .bind(tariff.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};
    use chrono::{NaiveTime, Utc, Weekday};
    use cue_core::{Money, RateType, Tariff, TariffRestrictions, TieredRate, TimeRange};

    fn tariff() -> Tariff {
        Tariff {
            id: uuid::Uuid::new_v4().to_string(),
            name: "Weekend nights".into(),
            rate: Money::from_cents(1400),
            rate_type: RateType::Hourly,
            free_minutes: 5,
            min_duration_minutes: Some(30),
            max_duration_minutes: None,
            restrictions: TariffRestrictions {
                days_of_week: vec![Weekday::Fri, Weekday::Sat],
                time_ranges: vec![TimeRange::new(
                    NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                )],
                min_players: Some(2),
                max_players: None,
            },
            tiered_rates: vec![TieredRate {
                threshold_minutes: 60,
                rate: Money::from_cents(1600),
            }],
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_tariff_json_columns_survive_storage() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.tariffs();
        let original = tariff();

        repo.save(&original).await.unwrap();
        let stored = repo.get(&original.id).await.unwrap().unwrap();

        assert_eq!(stored.restrictions, original.restrictions);
        assert_eq!(stored.tiered_rates, original.tiered_rates);
        assert_eq!(stored.min_duration_minutes, Some(30));
        assert!(repo.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_puts_active_first() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.tariffs();

        let mut retired = tariff();
        retired.name = "Old".into();
        retired.is_active = false;
        repo.save(&retired).await.unwrap();
        repo.save(&tariff()).await.unwrap();

        let listed = repo.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].is_active);
    }
}
