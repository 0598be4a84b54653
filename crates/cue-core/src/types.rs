//! # Domain Types
//!
//! Core domain types used throughout Cue Hall.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Table       │   │    Session      │   │     Tariff      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  table_id       │   │  id (UUID)      │       │
//! │  │  name           │   │  tariff (frozen │──►│  rate           │       │
//! │  │  status         │   │   snapshot)     │   │  rate_type      │       │
//! │  │  current_session│──►│  status         │   │  restrictions   │       │
//! │  │  revision       │   │  revision       │   │  tiered_rates   │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  TableStatus    │   │ SessionStatus   │   │    RateType     │       │
//! │  │  Available      │   │  Active         │   │  Hourly         │       │
//! │  │  Occupied       │   │  Paused         │   │  Fixed          │       │
//! │  │  Paused         │   │  Ended          │   │  Session        │       │
//! │  │  Cleaning       │   │  Finalized      │   └─────────────────┘       │
//! │  │  Maintenance    │   └─────────────────┘                              │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Revisions
//! Tables and sessions carry a `revision` that the server bumps on every
//! committed mutation. Terminals use it to order broadcasts per entity and
//! to decide when to drop an optimistic copy.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Table Status
// =============================================================================

/// Coarse occupancy status of a physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// Free to start a session.
    Available,
    /// A session is running.
    Occupied,
    /// The session on this table is paused.
    Paused,
    /// Session ended, staff must clean before the next start.
    Cleaning,
    /// Taken out of service by a manager.
    Maintenance,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Available => "available",
            TableStatus::Occupied => "occupied",
            TableStatus::Paused => "paused",
            TableStatus::Cleaning => "cleaning",
            TableStatus::Maintenance => "maintenance",
        }
    }
}

impl Default for TableStatus {
    fn default() -> Self {
        TableStatus::Available
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Table
// =============================================================================

/// A physical billable unit (pool table, snooker table, bar seat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Display name shown on the floor plan ("Table 3", "Snooker A").
    pub name: String,

    /// Maximum players for a session on this table.
    pub capacity: u32,

    /// Floor-plan room this table belongs to. Broadcasts are scoped by it.
    pub room: String,

    pub status: TableStatus,

    /// Session holding the table, from `start` until `clean`.
    pub current_session: Option<String>,

    /// Soft delete flag. Deleted tables keep their session history.
    pub deleted: bool,

    /// Monotonic per-entity revision, bumped on every commit.
    pub revision: i64,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Rate Type
// =============================================================================

/// How a tariff converts elapsed time into an amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RateType {
    /// `rate` is per hour, prorated per second of billable time.
    Hourly,
    /// `rate` is charged once `min_duration` is reached.
    Fixed,
    /// `rate` is charged as soon as the session exists.
    Session,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Hourly => "hourly",
            RateType::Fixed => "fixed",
            RateType::Session => "session",
        }
    }
}

impl Default for RateType {
    fn default() -> Self {
        RateType::Hourly
    }
}

// =============================================================================
// Tariff
// =============================================================================

/// A daily time window. `end < start` wraps past midnight (18:00 to 02:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TimeRange {
    #[ts(as = "String")]
    pub start: NaiveTime,
    #[ts(as = "String")]
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        TimeRange { start, end }
    }

    /// Checks whether `time` falls inside the window, start inclusive.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// When a tariff may be used to start a session. Empty lists mean "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase", default)]
pub struct TariffRestrictions {
    #[ts(as = "Vec<String>")]
    pub days_of_week: Vec<Weekday>,
    pub time_ranges: Vec<TimeRange>,
    pub min_players: Option<u32>,
    pub max_players: Option<u32>,
}

/// A marginal band: billable minutes below `threshold_minutes` (and above
/// the previous band) are billed at `rate` per hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TieredRate {
    pub threshold_minutes: u32,
    pub rate: Money,
}

/// Pricing policy converting session duration into an owed amount.
///
/// Sessions copy the whole tariff at start, so edits made here never
/// reach a session that is already running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Tariff {
    pub id: String,
    pub name: String,

    /// Per hour for `Hourly`, flat for `Fixed` and `Session`.
    pub rate: Money,

    pub rate_type: RateType,

    /// Minutes at the start of a session that are never billed.
    #[serde(default)]
    pub free_minutes: u32,

    #[serde(default)]
    pub min_duration_minutes: Option<u32>,

    /// Cap on billable minutes. `None` or `0` means unlimited.
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,

    #[serde(default)]
    pub restrictions: TariffRestrictions,

    /// Ordered by ascending threshold.
    #[serde(default)]
    pub tiered_rates: Vec<TieredRate>,

    pub is_active: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Tariff {
    /// Returns the billable cap in minutes, if one applies.
    pub fn max_minutes(&self) -> Option<u32> {
        self.max_duration_minutes.filter(|m| *m > 0)
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Lifecycle status of a billing session.
///
/// ```text
///   start        pause           end / finalize
/// ───────► Active ◄────► Paused ─────────────► Ended ──► Finalized
///            │    resume                          ▲          ▲
///            └──────────── end ───────────────────┘          │
///            └──────────── finalize ─────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Ended,
    Finalized,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Ended => "ended",
            SessionStatus::Finalized => "finalized",
        }
    }

    /// Active or Paused: the session still holds its table.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Paused)
    }

    /// Ended or Finalized: the amount is frozen.
    pub fn is_settled(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Finalized)
    }

    /// Table status implied by a session in this state.
    pub fn table_status(&self) -> TableStatus {
        match self {
            SessionStatus::Active => TableStatus::Occupied,
            SessionStatus::Paused => TableStatus::Paused,
            SessionStatus::Ended | SessionStatus::Finalized => TableStatus::Cleaning,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session
// =============================================================================

/// An add-on line billed with the session (drinks, chalk, cue rental).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SessionCharge {
    pub id: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: u32,
}

impl SessionCharge {
    #[inline]
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity as i64)
    }
}

/// Discount applied to the session total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Discount {
    /// Basis points off the gross total (1000 = 10%).
    Percent { bps: u32 },
    /// A fixed amount off the gross total.
    Fixed { amount: Money },
}

/// A billed usage period bound to one table and one tariff.
///
/// Never hard-deleted: settles into Ended/Finalized and is kept for
/// billing history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub table_id: String,
    pub tariff_id: String,

    /// Tariff captured at start (frozen).
    pub tariff: Tariff,

    pub status: SessionStatus,
    pub player_count: u32,

    #[ts(as = "String")]
    pub start_time: DateTime<Utc>,

    #[ts(as = "Option<String>")]
    pub paused_at: Option<DateTime<Utc>>,

    pub pause_reason: Option<String>,

    /// Total time spent in completed pauses, in milliseconds.
    pub accumulated_paused_ms: i64,

    #[ts(as = "Option<String>")]
    pub end_time: Option<DateTime<Utc>>,

    /// Amount frozen at `end` (or at `finalize` from an open session).
    pub frozen_amount: Option<Money>,

    #[ts(as = "Option<String>")]
    pub finalized_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub charges: Vec<SessionCharge>,

    #[serde(default)]
    pub discount: Option<Discount>,

    pub notes: Option<String>,

    pub revision: i64,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_time_range_same_day() {
        let range = TimeRange::new(hm(9, 0), hm(17, 0));
        assert!(range.contains(hm(9, 0)));
        assert!(range.contains(hm(16, 59)));
        assert!(!range.contains(hm(17, 0)));
        assert!(!range.contains(hm(8, 59)));
    }

    #[test]
    fn test_time_range_wraps_midnight() {
        let range = TimeRange::new(hm(18, 0), hm(2, 0));
        assert!(range.contains(hm(23, 30)));
        assert!(range.contains(hm(0, 15)));
        assert!(!range.contains(hm(2, 0)));
        assert!(!range.contains(hm(12, 0)));
    }

    #[test]
    fn test_session_status_maps_to_table_status() {
        assert_eq!(SessionStatus::Active.table_status(), TableStatus::Occupied);
        assert_eq!(SessionStatus::Paused.table_status(), TableStatus::Paused);
        assert_eq!(SessionStatus::Ended.table_status(), TableStatus::Cleaning);
        assert_eq!(SessionStatus::Finalized.table_status(), TableStatus::Cleaning);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TableStatus::Maintenance).unwrap(),
            "\"maintenance\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Finalized).unwrap(),
            "\"finalized\""
        );
    }

    #[test]
    fn test_discount_serialization() {
        let json = serde_json::to_value(Discount::Percent { bps: 1500 }).unwrap();
        assert_eq!(json["kind"], "percent");
        assert_eq!(json["bps"], 1500);
    }

    #[test]
    fn test_restrictions_default_from_empty_json() {
        let restrictions: TariffRestrictions = serde_json::from_str("{}").unwrap();
        assert!(restrictions.days_of_week.is_empty());
        assert!(restrictions.time_ranges.is_empty());
        assert_eq!(restrictions.min_players, None);
    }

    #[test]
    fn test_charge_line_total() {
        let charge = SessionCharge {
            id: "c1".into(),
            name: "Chalk".into(),
            unit_price: Money::from_cents(150),
            quantity: 3,
        };
        assert_eq!(charge.line_total().cents(), 450);
    }
}
