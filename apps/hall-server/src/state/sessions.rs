//! # Session Manager
//!
//! Runs the session state machine against the floor. Each transition takes
//! the table lease, applies the pure transition from `cue_core::session` to
//! cloned entities, and commits table and session together.
//!
//! ```text
//!              start                pause
//!   (none) ─────────────► Active ◄──────────► Paused
//!                           │       resume      │
//!                           │ end               │ end
//!                           ▼                   ▼
//!                         Ended ◄───────────────┘
//!                           │ finalize (Active/Paused settle first)
//!                           ▼
//!                       Finalized ── finalize again: no-op
//! ```

use std::sync::Arc;

use chrono::{FixedOffset, Utc};
use tracing::{debug, info};

use cue_core::tariff::{self, TariffContext};
use cue_core::{CoreError, Discount, FinalizeOutcome, Money, Session, SessionStatus, Table};

use crate::error::ApiResult;
use crate::state::floor::{Floor, TableLease};
use crate::state::ActionResult;

pub struct SessionManager {
    floor: Arc<Floor>,
    venue_offset: FixedOffset,
}

impl SessionManager {
    pub fn new(floor: Arc<Floor>, venue_offset: FixedOffset) -> Self {
        SessionManager { floor, venue_offset }
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// None → Active on an available table.
    ///
    /// ## Errors
    /// - `Conflict` if the table is not available or busy with another action
    /// - `InvalidTariff` if the tariff is unknown, inactive or restricted now
    /// - `Validation` if the player count is zero or above capacity
    pub async fn start(&self, table_id: &str, tariff_id: &str, player_count: u32) -> ApiResult<ActionResult> {
        let lease = self.floor.lease(table_id)?;
        let now = Utc::now();

        let (mut table, tariff) = {
            let floor = self.floor.read().await;
            let table = floor
                .tables
                .get(table_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found("table", table_id))?;
            let tariff = floor
                .tariffs
                .get(tariff_id)
                .cloned()
                .ok_or_else(|| CoreError::invalid_tariff(tariff_id, "unknown tariff"))?;
            (table, tariff)
        };

        cue_core::table::ensure_can_start(&table)?;
        let context = TariffContext::at(now, self.venue_offset, player_count);
        let bound = tariff::resolve(&tariff, &context)?;

        let session = Session::start(&table, bound, player_count, now)?;
        table.follow_session(&session, now);

        let (table, session) = self.floor.commit(&lease, table, Some(session)).await?;
        info!(table_id, tariff_id, player_count, "Session started");
        Ok(ActionResult::new(table, session.as_ref()))
    }

    /// Active → Paused.
    pub async fn pause(&self, table_id: &str, reason: Option<String>) -> ApiResult<ActionResult> {
        self.transition(table_id, "pause", |session, now| session.pause(now, reason))
            .await
    }

    /// Paused → Active.
    pub async fn resume(&self, table_id: &str) -> ApiResult<ActionResult> {
        self.transition(table_id, "resume", |session, now| session.resume(now))
            .await
    }

    /// {Active, Paused} → Ended. Freezes the amount; the table goes to
    /// cleaning.
    pub async fn end(&self, table_id: &str) -> ApiResult<ActionResult> {
        self.transition(table_id, "end", |session, now| {
            let amount = session.end(now)?;
            debug!(session_id = %session.id, %amount, "Amount frozen");
            Ok(())
        })
        .await
    }

    /// {Active, Paused, Ended} → Finalized. Repeating it returns the settled
    /// session unchanged.
    pub async fn finalize(&self, table_id: &str) -> ApiResult<ActionResult> {
        let lease = self.floor.lease(table_id)?;
        let (table, held) = self.held(table_id).await?;

        let Some(mut session) = held else {
            return self.finalize_released(&lease, table).await;
        };

        let now = Utc::now();
        if session.finalize(now)? == FinalizeOutcome::AlreadyFinalized {
            debug!(table_id, session_id = %session.id, "Session already finalized");
            return Ok(ActionResult::new(table, Some(&session)));
        }

        let mut table = table;
        table.follow_session(&session, now);
        let (table, session) = self.floor.commit(&lease, table, Some(session)).await?;
        info!(table_id, "Session finalized");
        Ok(ActionResult::new(table, session.as_ref()))
    }

    /// Finalize on a table already cleaned: settles its most recent session
    /// if that one ended without being finalized.
    async fn finalize_released(&self, lease: &TableLease, table: Table) -> ApiResult<ActionResult> {
        let latest = self.floor.db().sessions().latest_for_table(&table.id).await?;

        match latest {
            Some(session) if session.status == SessionStatus::Finalized => {
                Ok(ActionResult::new(table, Some(&session)))
            }
            Some(mut session) if session.status == SessionStatus::Ended => {
                session.finalize(Utc::now())?;
                let session = self.floor.commit_session(lease, session, &table.room).await?;
                info!(table_id = %table.id, session_id = %session.id, "Released session finalized");
                Ok(ActionResult::new(table, Some(&session)))
            }
            _ => Err(no_session(&table, "finalize").into()),
        }
    }

    /// Shared path for transitions that only touch the held session.
    async fn transition<F>(&self, table_id: &str, action: &str, apply: F) -> ApiResult<ActionResult>
    where
        F: FnOnce(&mut Session, chrono::DateTime<Utc>) -> Result<(), CoreError>,
    {
        let lease = self.floor.lease(table_id)?;
        let (mut table, held) = self.held(table_id).await?;
        let mut session = held.ok_or_else(|| no_session(&table, action))?;

        let now = Utc::now();
        apply(&mut session, now)?;
        table.follow_session(&session, now);

        let (table, session) = self.floor.commit(&lease, table, Some(session)).await?;
        info!(table_id, action, status = %table.status, "Session transition committed");
        Ok(ActionResult::new(table, session.as_ref()))
    }

    // =========================================================================
    // Charges & Discounts
    // =========================================================================

    pub async fn add_charge(
        &self,
        session_id: &str,
        name: &str,
        unit_price: Money,
        quantity: u32,
    ) -> ApiResult<Session> {
        self.amend(session_id, |session| session.add_charge(name, unit_price, quantity).map(|_| ()))
            .await
    }

    pub async fn remove_charge(&self, session_id: &str, charge_id: &str) -> ApiResult<Session> {
        self.amend(session_id, |session| session.remove_charge(charge_id).map(|_| ()))
            .await
    }

    pub async fn set_discount(&self, session_id: &str, discount: Option<Discount>) -> ApiResult<Session> {
        self.amend(session_id, |session| session.set_discount(discount))
            .await
    }

    async fn amend<F>(&self, session_id: &str, apply: F) -> ApiResult<Session>
    where
        F: FnOnce(&mut Session) -> Result<(), CoreError>,
    {
        let table_id = self.session(session_id).await?.table_id;
        let lease = self.floor.lease(&table_id)?;

        // Re-read under the lease so the change applies to the latest revision.
        let mut session = self.session(session_id).await?;
        apply(&mut session)?;

        let room = match self.floor.table(&table_id).await {
            Ok(table) => table.room,
            Err(_) => self
                .floor
                .db()
                .tables()
                .get(&table_id)
                .await?
                .map(|t| t.room)
                .unwrap_or_default(),
        };
        Ok(self.floor.commit_session(&lease, session, &room).await?)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// The session a table holds, or else its most recent one.
    pub async fn session_for_table(&self, table_id: &str) -> ApiResult<Option<Session>> {
        let (_, held) = self.held(table_id).await?;
        match held {
            Some(session) => Ok(Some(session)),
            None => Ok(self.floor.db().sessions().latest_for_table(table_id).await?),
        }
    }

    /// Active and Paused sessions.
    pub async fn active_sessions(&self) -> Vec<Session> {
        let floor = self.floor.read().await;
        let mut sessions: Vec<Session> = floor
            .sessions
            .values()
            .filter(|s| s.status.is_open())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.start_time);
        sessions
    }

    pub async fn session(&self, session_id: &str) -> ApiResult<Session> {
        if let Some(session) = self.floor.read().await.sessions.get(session_id) {
            return Ok(session.clone());
        }
        self.floor
            .db()
            .sessions()
            .get(session_id)
            .await?
            .ok_or_else(|| CoreError::not_found("session", session_id).into())
    }

    pub async fn history(&self, table_id: &str, limit: u32) -> ApiResult<Vec<Session>> {
        Ok(self.floor.db().sessions().history(table_id, limit).await?)
    }

    async fn held(&self, table_id: &str) -> ApiResult<(Table, Option<Session>)> {
        let floor = self.floor.read().await;
        let table = floor
            .tables
            .get(table_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("table", table_id))?;
        let session = floor.session_of(&table).cloned();
        Ok((table, session))
    }
}

fn no_session(table: &Table, action: &str) -> CoreError {
    CoreError::invalid_transition("table", &table.id, format!("{} without a session", table.status), action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::testing::{self, caller, MANAGER_PIN};
    use cue_core::{Role, TableAction, TableStatus};

    use crate::state::floor::FloorState;

    fn core(err: ApiError) -> CoreError {
        match err {
            ApiError::Core(e) => e,
            other => panic!("Expected a domain error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_occupies_table() {
        let (app, table, tariff) = testing::seeded().await;

        let result = app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();
        let view = result.session.unwrap();

        assert_eq!(result.table.status, TableStatus::Occupied);
        assert_eq!(result.table.current_session.as_deref(), Some(view.id.as_str()));
        assert_eq!(view.status, SessionStatus::Active);
        assert_eq!(view.tariff_name, "Standard");
        assert_eq!(app.sessions.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_start_on_occupied_table_conflicts() {
        let (app, table, tariff) = testing::seeded().await;
        let first = app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let err = core(app.sessions.start(&table.id, &tariff.id, 2).await.unwrap_err());
        assert!(matches!(err, CoreError::Conflict { .. }));

        let after = app.tables.get(&table.id).await.unwrap();
        assert_eq!(after, first.table);
        assert_eq!(app.sessions.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let (app, table, tariff) = testing::seeded().await;

        let (a, b) = tokio::join!(
            app.sessions.start(&table.id, &tariff.id, 2),
            app.sessions.start(&table.id, &tariff.id, 3),
        );

        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(core(loser.unwrap_err()), CoreError::Conflict { .. }));
        assert_eq!(app.sessions.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_tariff_edit_does_not_reach_running_session() {
        let (app, table, _) = testing::seeded().await;
        let mut tariff = testing::hourly_tariff(1000, 0);
        tariff.min_duration_minutes = Some(60);
        let tariff = app.floor.save_tariff(tariff).await.unwrap();

        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let mut edited = tariff.clone();
        edited.rate = Money::from_cents(5000);
        edited.min_duration_minutes = Some(120);
        edited.restrictions.max_players = Some(1);
        edited.is_active = false;
        app.floor.save_tariff(edited).await.unwrap();
        assert_eq!(
            app.floor.read().await.tariffs[&tariff.id].rate,
            Money::from_cents(5000)
        );

        let session = app.sessions.session_for_table(&table.id).await.unwrap().unwrap();
        assert_eq!(session.tariff, tariff);
        let start = session.start_time;
        assert_eq!(
            session.current_amount(start + chrono::Duration::minutes(25)),
            Money::from_cents(1000)
        );
        assert_eq!(
            session.current_amount(start + chrono::Duration::minutes(90)),
            Money::from_cents(1500)
        );

        let ended = app.sessions.end(&table.id).await.unwrap();
        assert_eq!(ended.session.unwrap().current_amount, Money::from_cents(1000));

        let settled = app.sessions.session_for_table(&table.id).await.unwrap().unwrap();
        assert_eq!(settled.frozen_amount, Some(Money::from_cents(1000)));
        assert_eq!(settled.tariff.rate, Money::from_cents(1000));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_tariff_and_players() {
        let (app, table, _) = testing::seeded().await;

        let mut inactive = testing::hourly_tariff(1000, 0);
        inactive.is_active = false;
        let inactive = app.floor.save_tariff(inactive).await.unwrap();

        let err = core(app.sessions.start(&table.id, &inactive.id, 2).await.unwrap_err());
        assert!(matches!(err, CoreError::InvalidTariff { .. }));

        let err = core(app.sessions.start(&table.id, "no-such-tariff", 2).await.unwrap_err());
        assert!(matches!(err, CoreError::InvalidTariff { .. }));

        let standard = app.floor.save_tariff(testing::hourly_tariff(1000, 0)).await.unwrap();
        let err = core(app.sessions.start(&table.id, &standard.id, 9).await.unwrap_err());
        assert!(matches!(err, CoreError::Validation(_)));

        assert_eq!(app.tables.get(&table.id).await.unwrap().status, TableStatus::Available);
    }

    #[tokio::test]
    async fn test_pause_resume_and_illegal_transition() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let paused = app.sessions.pause(&table.id, Some("phone call".into())).await.unwrap();
        assert_eq!(paused.table.status, TableStatus::Paused);
        assert_eq!(paused.session.unwrap().pause_reason.as_deref(), Some("phone call"));

        let before = app.tables.get(&table.id).await.unwrap();
        let err = core(app.sessions.pause(&table.id, None).await.unwrap_err());
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(app.tables.get(&table.id).await.unwrap().revision, before.revision);

        let resumed = app.sessions.resume(&table.id).await.unwrap();
        assert_eq!(resumed.table.status, TableStatus::Occupied);
    }

    #[tokio::test]
    async fn test_staff_end_waits_for_pin() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();
        let staff = caller(Role::Staff);

        let end = TableAction::End {
            table_id: table.id.clone(),
        };
        let pending_id = match core(app.perform(&staff, end).await.unwrap_err()) {
            CoreError::Unauthorized {
                pending_id: Some(id), ..
            } => id,
            other => panic!("Expected Unauthorized with a pending id, got {other:?}"),
        };
        assert_eq!(app.tables.get(&table.id).await.unwrap().status, TableStatus::Occupied);

        let result = app
            .verify_pin(&staff, &pending_id, MANAGER_PIN)
            .await
            .unwrap()
            .expect("PIN should match");
        assert_eq!(result.table.status, TableStatus::Cleaning);
        assert_eq!(result.session.unwrap().status, SessionStatus::Ended);

        // The grant was consumed.
        let err = core(app.verify_pin(&staff, &pending_id, MANAGER_PIN).await.unwrap_err());
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_manager_ends_directly() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let end = TableAction::End {
            table_id: table.id.clone(),
        };
        let result = app.perform(&caller(Role::Manager), end).await.unwrap();
        assert_eq!(result.session.unwrap().status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();
        app.sessions.end(&table.id).await.unwrap();

        let first = app.sessions.finalize(&table.id).await.unwrap();
        let second = app.sessions.finalize(&table.id).await.unwrap();

        let (first, second) = (first.session.unwrap(), second.session.unwrap());
        assert_eq!(first.status, SessionStatus::Finalized);
        assert_eq!(second.status, SessionStatus::Finalized);
        assert_eq!(first.current_amount, second.current_amount);
        assert_eq!(first.revision, second.revision);
    }

    #[tokio::test]
    async fn test_clean_releases_table_and_keeps_history() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let err = core(app.tables.clean(&table.id).await.unwrap_err());
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        app.sessions.end(&table.id).await.unwrap();
        let cleaned = app.tables.clean(&table.id).await.unwrap();
        assert_eq!(cleaned.table.status, TableStatus::Available);
        assert!(cleaned.table.current_session.is_none());

        let latest = app.sessions.session_for_table(&table.id).await.unwrap().unwrap();
        assert_eq!(latest.status, SessionStatus::Ended);
        assert_eq!(app.sessions.history(&table.id, 10).await.unwrap().len(), 1);

        // An ended session can still be settled after the table is released.
        let settled = app.sessions.finalize(&table.id).await.unwrap();
        assert_eq!(settled.session.unwrap().status, SessionStatus::Finalized);
        assert_eq!(settled.table.status, TableStatus::Available);
    }

    #[tokio::test]
    async fn test_charges_and_discount() {
        let (app, table, tariff) = testing::seeded().await;
        let started = app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();
        let session_id = started.session.unwrap().id;

        let session = app
            .sessions
            .add_charge(&session_id, "Cola", Money::from_cents(250), 2)
            .await
            .unwrap();
        assert_eq!(session.charges.len(), 1);
        let charge_id = session.charges[0].id.clone();

        let session = app
            .sessions
            .set_discount(&session_id, Some(Discount::Fixed { amount: Money::from_cents(100) }))
            .await
            .unwrap();
        assert_eq!(session.current_amount(Utc::now()).cents(), 400);

        let session = app.sessions.remove_charge(&session_id, &charge_id).await.unwrap();
        assert!(session.charges.is_empty());

        app.sessions.end(&table.id).await.unwrap();
        let err = core(
            app.sessions
                .add_charge(&session_id, "Cola", Money::from_cents(250), 1)
                .await
                .unwrap_err(),
        );
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_committed_state_survives_reload() {
        let (app, table, tariff) = testing::seeded().await;
        let started = app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        let reloaded = FloorState::load(&app.db).await.unwrap();
        let held = reloaded.tables.get(&table.id).unwrap();
        assert_eq!(held.status, TableStatus::Occupied);
        assert_eq!(held.revision, started.table.revision);
        assert!(reloaded.session_of(held).is_some());
    }
}
