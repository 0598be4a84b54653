//! # Session State Machine
//!
//! Pure transitions for a billing session. Every method checks its guard
//! before touching a field, so a rejected transition leaves the session
//! exactly as it was.
//!
//! ## Transition Graph
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   None ──start──► Active ──pause──► Paused                              │
//! │                    ▲  │             │  │                                │
//! │                    └──┼──resume─────┘  │                                │
//! │                       │                │                                │
//! │                       ├──end───────────┼──► Ended ──finalize──┐        │
//! │                       │                │                      ▼        │
//! │                       └──finalize──────┴──────────────► Finalized      │
//! │                                                         (idempotent)   │
//! │                                                                         │
//! │   Nothing leaves Ended except finalize. Nothing leaves Finalized.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server stamps `revision` when it commits; these functions only
//! decide what the next state is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::tariff::{self, BillingBreakdown};
use crate::types::{Discount, Session, SessionCharge, SessionStatus, Table, Tariff};
use crate::validation;

/// Result of a finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The session moved to Finalized now.
    Finalized,
    /// The session was already Finalized; nothing changed.
    AlreadyFinalized,
}

impl Session {
    /// Opens a new Active session on `table` bound to the resolved `tariff`.
    ///
    /// ## Errors
    /// - `Conflict` if the table is not available
    /// - `Validation` if `player_count` is zero or exceeds the table capacity
    pub fn start(
        table: &Table,
        tariff: Tariff,
        player_count: u32,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        crate::table::ensure_can_start(table)?;
        validation::validate_player_count(player_count, table.capacity)?;

        Ok(Session {
            id: Uuid::new_v4().to_string(),
            table_id: table.id.clone(),
            tariff_id: tariff.id.clone(),
            tariff,
            status: SessionStatus::Active,
            player_count,
            start_time: now,
            paused_at: None,
            pause_reason: None,
            accumulated_paused_ms: 0,
            end_time: None,
            frozen_amount: None,
            finalized_at: None,
            charges: Vec::new(),
            discount: None,
            notes: None,
            revision: 0,
        })
    }

    /// Active → Paused.
    pub fn pause(&mut self, now: DateTime<Utc>, reason: Option<String>) -> CoreResult<()> {
        if self.status != SessionStatus::Active {
            return Err(self.rejected("pause"));
        }

        self.status = SessionStatus::Paused;
        self.paused_at = Some(now.max(self.start_time));
        self.pause_reason = reason.filter(|r| !r.trim().is_empty());
        Ok(())
    }

    /// Paused → Active. Folds the pause into `accumulated_paused_ms`.
    pub fn resume(&mut self, now: DateTime<Utc>) -> CoreResult<()> {
        if self.status != SessionStatus::Paused {
            return Err(self.rejected("resume"));
        }

        self.close_pause(now);
        self.status = SessionStatus::Active;
        Ok(())
    }

    /// {Active, Paused} → Ended. Freezes and returns the owed amount.
    pub fn end(&mut self, now: DateTime<Utc>) -> CoreResult<Money> {
        if !self.status.is_open() {
            return Err(self.rejected("end"));
        }

        Ok(self.settle(now))
    }

    /// {Active, Paused, Ended} → Finalized.
    ///
    /// Finalizing an open session freezes the amount first, as `end` does.
    /// A second call is a no-op that reports [`FinalizeOutcome::AlreadyFinalized`].
    pub fn finalize(&mut self, now: DateTime<Utc>) -> CoreResult<FinalizeOutcome> {
        match self.status {
            SessionStatus::Finalized => Ok(FinalizeOutcome::AlreadyFinalized),
            SessionStatus::Active | SessionStatus::Paused => {
                self.settle(now);
                self.status = SessionStatus::Finalized;
                self.finalized_at = Some(now);
                Ok(FinalizeOutcome::Finalized)
            }
            SessionStatus::Ended => {
                self.status = SessionStatus::Finalized;
                self.finalized_at = Some(now);
                Ok(FinalizeOutcome::Finalized)
            }
        }
    }

    /// Adds an add-on line. Only while the session is open.
    pub fn add_charge(
        &mut self,
        name: &str,
        unit_price: Money,
        quantity: u32,
    ) -> CoreResult<SessionCharge> {
        if !self.status.is_open() {
            return Err(self.rejected("add a charge to"));
        }
        validation::validate_charge_name(name)?;
        validation::validate_price_cents(unit_price.cents())?;
        validation::validate_quantity(quantity as i64)?;

        let charge = SessionCharge {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            unit_price,
            quantity,
        };
        self.charges.push(charge.clone());
        Ok(charge)
    }

    /// Removes an add-on line. Only while the session is open.
    pub fn remove_charge(&mut self, charge_id: &str) -> CoreResult<SessionCharge> {
        if !self.status.is_open() {
            return Err(self.rejected("remove a charge from"));
        }

        let index = self
            .charges
            .iter()
            .position(|c| c.id == charge_id)
            .ok_or_else(|| CoreError::not_found("charge", charge_id))?;
        Ok(self.charges.remove(index))
    }

    /// Sets or clears the discount. Allowed until the session is Finalized;
    /// on an Ended session the frozen amount is recomputed.
    pub fn set_discount(&mut self, discount: Option<Discount>) -> CoreResult<()> {
        if self.status == SessionStatus::Finalized {
            return Err(self.rejected("discount"));
        }
        if let Some(Discount::Percent { bps }) = discount {
            validation::validate_discount_bps(bps)?;
        }
        if let Some(Discount::Fixed { amount }) = discount {
            validation::validate_price_cents(amount.cents())?;
        }

        self.discount = discount;
        if let Some(end_time) = self.end_time {
            self.frozen_amount = Some(tariff::compute_amount(self, &self.tariff, end_time));
        }
        Ok(())
    }

    /// Live owed amount at `now`, or the frozen amount once settled.
    pub fn current_amount(&self, now: DateTime<Utc>) -> Money {
        match self.frozen_amount {
            Some(frozen) if self.status.is_settled() => frozen,
            _ => tariff::compute_amount(self, &self.tariff, now),
        }
    }

    /// Itemized bill at `now` against the frozen tariff.
    pub fn breakdown(&self, now: DateTime<Utc>) -> BillingBreakdown {
        tariff::compute_breakdown(self, &self.tariff, now)
    }

    /// Active seconds at `now`.
    pub fn active_seconds(&self, now: DateTime<Utc>) -> i64 {
        tariff::elapsed_active_seconds(self, now)
    }

    fn close_pause(&mut self, now: DateTime<Utc>) {
        if let Some(paused_at) = self.paused_at.take() {
            let paused_ms = (now - paused_at).num_milliseconds().max(0);
            self.accumulated_paused_ms += paused_ms;
        }
        self.pause_reason = None;
    }

    fn settle(&mut self, now: DateTime<Utc>) -> Money {
        self.close_pause(now);
        self.status = SessionStatus::Ended;
        self.end_time = Some(now.max(self.start_time));
        let amount = tariff::compute_amount(self, &self.tariff, now);
        self.frozen_amount = Some(amount);
        amount
    }

    fn rejected(&self, action: &str) -> CoreError {
        CoreError::invalid_transition("session", &self.id, self.status, action)
    }
}

// =============================================================================
// Session View
// =============================================================================

/// Read model a terminal renders for a table's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub table_id: String,
    #[ts(as = "String")]
    pub start_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub tariff_name: String,
    pub current_amount: Money,
    /// Active (non-paused) seconds.
    pub duration: i64,
    pub player_count: u32,
    pub pause_reason: Option<String>,
    pub breakdown: BillingBreakdown,
    pub revision: i64,
}

impl SessionView {
    pub fn at(session: &Session, now: DateTime<Utc>) -> Self {
        let breakdown = session.breakdown(now);
        SessionView {
            id: session.id.clone(),
            table_id: session.table_id.clone(),
            start_time: session.start_time,
            status: session.status,
            tariff_name: session.tariff.name.clone(),
            current_amount: session.current_amount(now),
            duration: breakdown.elapsed_seconds,
            player_count: session.player_count,
            pause_reason: session.pause_reason.clone(),
            breakdown,
            revision: session.revision,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RateType, TableStatus, TariffRestrictions};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
    }

    fn min(m: i64) -> DateTime<Utc> {
        t0() + Duration::minutes(m)
    }

    fn tariff() -> Tariff {
        Tariff {
            id: "tariff-1".into(),
            name: "Standard".into(),
            rate: Money::from_cents(1000),
            rate_type: RateType::Hourly,
            free_minutes: 10,
            min_duration_minutes: None,
            max_duration_minutes: None,
            restrictions: TariffRestrictions::default(),
            tiered_rates: Vec::new(),
            is_active: true,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn table(status: TableStatus) -> Table {
        Table {
            id: "table-1".into(),
            name: "Table 1".into(),
            capacity: 4,
            room: "main".into(),
            status,
            current_session: None,
            deleted: false,
            revision: 1,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn started() -> Session {
        Session::start(&table(TableStatus::Available), tariff(), 2, t0()).unwrap()
    }

    #[test]
    fn test_start_binds_tariff_snapshot() {
        let session = started();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.start_time, t0());
        assert_eq!(session.accumulated_paused_ms, 0);
        assert_eq!(session.tariff.name, "Standard");
    }

    #[test]
    fn test_start_on_busy_table_conflicts() {
        for status in [TableStatus::Occupied, TableStatus::Paused, TableStatus::Cleaning] {
            let err = Session::start(&table(status), tariff(), 2, t0()).unwrap_err();
            assert!(matches!(err, CoreError::Conflict { .. }), "{status}");
        }
    }

    #[test]
    fn test_start_validates_player_count() {
        let available = table(TableStatus::Available);
        assert!(Session::start(&available, tariff(), 0, t0()).is_err());
        assert!(Session::start(&available, tariff(), 5, t0()).is_err());
    }

    #[test]
    fn test_paused_time_is_not_billed() {
        let mut session = started();
        session.pause(min(10), None).unwrap();
        session.resume(min(40)).unwrap();
        let amount = session.end(min(50)).unwrap();

        assert_eq!(session.active_seconds(min(50)), 20 * 60);
        assert_eq!(amount.cents(), 167);
        assert_eq!(amount.to_string(), "$1.67");
        assert_eq!(session.status, SessionStatus::Ended);
    }

    #[test]
    fn test_pause_then_resume_same_instant_keeps_amount() {
        let mut session = started();
        let before = session.current_amount(min(45));

        session.pause(min(45), Some("phone call".into())).unwrap();
        session.resume(min(45)).unwrap();

        assert_eq!(session.current_amount(min(45)), before);
        assert_eq!(session.accumulated_paused_ms, 0);
        assert_eq!(session.pause_reason, None);
    }

    #[test]
    fn test_illegal_transitions_leave_state_unchanged() {
        let mut session = started();
        session.end(min(30)).unwrap();
        let snapshot = session.clone();

        assert!(matches!(
            session.pause(min(31), None),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(session.resume(min(31)).is_err());
        assert!(session.end(min(31)).is_err());
        assert!(session.add_charge("Soda", Money::from_cents(200), 1).is_err());
        assert_eq!(session, snapshot);
    }

    #[test]
    fn test_resume_requires_pause() {
        let mut session = started();
        let err = session.resume(min(5)).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Cannot resume session {} while active", session.id)
        );
    }

    #[test]
    fn test_end_from_paused_excludes_running_pause() {
        let mut session = started();
        session.pause(min(40), None).unwrap();
        let amount = session.end(min(100)).unwrap();

        // 40 active minutes, 10 free
        assert_eq!(amount.cents(), 500);
        assert_eq!(session.paused_at, None);
        assert_eq!(session.accumulated_paused_ms, 60 * 60 * 1000);
    }

    #[test]
    fn test_ended_amount_is_frozen() {
        let mut session = started();
        let frozen = session.end(min(25)).unwrap();

        assert_eq!(frozen.cents(), 250);
        assert_eq!(session.current_amount(min(600)), frozen);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut session = started();
        session.end(min(25)).unwrap();

        assert_eq!(session.finalize(min(30)).unwrap(), FinalizeOutcome::Finalized);
        let first = session.clone();
        assert_eq!(
            session.finalize(min(90)).unwrap(),
            FinalizeOutcome::AlreadyFinalized
        );

        assert_eq!(session, first);
        assert_eq!(session.frozen_amount, Some(Money::from_cents(250)));
    }

    #[test]
    fn test_finalize_from_active_freezes_amount() {
        let mut session = started();
        session.finalize(min(70)).unwrap();

        assert_eq!(session.status, SessionStatus::Finalized);
        assert_eq!(session.end_time, Some(min(70)));
        assert_eq!(session.frozen_amount, Some(Money::from_cents(1000)));
    }

    #[test]
    fn test_charges_only_while_open() {
        let mut session = started();
        let charge = session.add_charge("Chalk", Money::from_cents(150), 2).unwrap();
        assert_eq!(session.breakdown(min(5)).charges_total.cents(), 300);

        session.remove_charge(&charge.id).unwrap();
        assert!(session.charges.is_empty());
        assert!(matches!(
            session.remove_charge("missing"),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_discount_on_ended_session_refreezes() {
        let mut session = started();
        session.end(min(70)).unwrap();
        assert_eq!(session.frozen_amount, Some(Money::from_cents(1000)));

        session
            .set_discount(Some(Discount::Percent { bps: 5000 }))
            .unwrap();
        assert_eq!(session.frozen_amount, Some(Money::from_cents(500)));

        session.finalize(min(80)).unwrap();
        assert!(session.set_discount(None).is_err());
    }

    #[test]
    fn test_session_view() {
        let session = started();
        let view = SessionView::at(&session, min(25));

        assert_eq!(view.tariff_name, "Standard");
        assert_eq!(view.current_amount.cents(), 250);
        assert_eq!(view.duration, 25 * 60);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("tariffName").is_some());
        assert!(json.get("currentAmount").is_some());
    }
}
