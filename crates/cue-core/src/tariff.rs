//! # Tariff Engine
//!
//! Resolves pricing rules at session start and computes the live owed
//! amount from elapsed active time.
//!
//! ## Amount Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  elapsed = (end − start_time) − accumulated_paused                      │
//! │            end = now | paused_at | end_time                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  HOURLY:  billed   = max(elapsed, min_duration)                         │
//! │           billable = min(billed − free_minutes, max_duration)           │
//! │           amount   = Σ bands (rate × seconds) / 3600, rounded once      │
//! │  FIXED:   amount   = rate if elapsed ≥ min_duration else 0              │
//! │  SESSION: amount   = rate                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  total = max(0, amount + charges − discount)                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything here is a pure function of the session, its frozen tariff and
//! `now`. Terminals call [`compute_amount`] on every tick to render a live
//! meter; the server calls it once at `end` to freeze the amount.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::types::{Discount, RateType, Session, SessionStatus, Tariff};

// =============================================================================
// Resolution
// =============================================================================

/// Facts a tariff's restrictions are checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TariffContext {
    /// Venue-local wall clock time.
    pub local_time: NaiveDateTime,
    pub player_count: u32,
}

impl TariffContext {
    pub fn new(local_time: NaiveDateTime, player_count: u32) -> Self {
        TariffContext {
            local_time,
            player_count,
        }
    }

    /// Builds a context from a UTC instant and the venue's UTC offset.
    pub fn at(now: DateTime<Utc>, offset: FixedOffset, player_count: u32) -> Self {
        TariffContext {
            local_time: now.with_timezone(&offset).naive_local(),
            player_count,
        }
    }
}

/// Checks the tariff against `ctx` and returns the snapshot a new session
/// binds to.
///
/// ## Errors
/// `InvalidTariff` when the tariff is inactive, or the day, time of day or
/// player count is outside its restrictions.
pub fn resolve(tariff: &Tariff, ctx: &TariffContext) -> CoreResult<Tariff> {
    if !tariff.is_active {
        return Err(CoreError::invalid_tariff(&tariff.id, "tariff is inactive"));
    }

    let rules = &tariff.restrictions;

    if !rules.days_of_week.is_empty() {
        let weekday = ctx.local_time.weekday();
        if !rules.days_of_week.contains(&weekday) {
            return Err(CoreError::invalid_tariff(
                &tariff.id,
                format!("not valid on {weekday}"),
            ));
        }
    }

    if !rules.time_ranges.is_empty() {
        let time = ctx.local_time.time();
        if !rules.time_ranges.iter().any(|r| r.contains(time)) {
            return Err(CoreError::invalid_tariff(
                &tariff.id,
                format!("not valid at {}", time.format("%H:%M")),
            ));
        }
    }

    if let Some(min) = rules.min_players {
        if ctx.player_count < min {
            return Err(CoreError::invalid_tariff(
                &tariff.id,
                format!("requires at least {min} players"),
            ));
        }
    }

    if let Some(max) = rules.max_players {
        if ctx.player_count > max {
            return Err(CoreError::invalid_tariff(
                &tariff.id,
                format!("allows at most {max} players"),
            ));
        }
    }

    Ok(tariff.clone())
}

/// Validates a tariff definition before it is stored.
pub fn validate_tariff(tariff: &Tariff) -> CoreResult<()> {
    let invalid = |reason: &str| Err(CoreError::invalid_tariff(&tariff.id, reason));

    if tariff.name.trim().is_empty() {
        return invalid("name is required");
    }
    if tariff.rate.is_negative() {
        return invalid("rate must not be negative");
    }
    if let (Some(min), Some(max)) = (tariff.min_duration_minutes, tariff.max_minutes()) {
        if min > max {
            return invalid("min duration exceeds max duration");
        }
    }
    if let (Some(min), Some(max)) = (
        tariff.restrictions.min_players,
        tariff.restrictions.max_players,
    ) {
        if min > max {
            return invalid("min players exceeds max players");
        }
    }
    if tariff.restrictions.max_players == Some(0) {
        return invalid("max players must be positive");
    }

    let mut previous = 0;
    for tier in &tariff.tiered_rates {
        if tier.threshold_minutes <= previous {
            return invalid("tier thresholds must be strictly ascending");
        }
        if tier.rate.is_negative() {
            return invalid("tier rate must not be negative");
        }
        previous = tier.threshold_minutes;
    }

    Ok(())
}

// =============================================================================
// Amount Computation
// =============================================================================

/// Itemized result of [`compute_breakdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct BillingBreakdown {
    /// Active (non-paused) seconds since start.
    pub elapsed_seconds: i64,
    /// Free seconds consumed by this session.
    pub free_seconds_used: i64,
    /// Seconds actually charged after the min/free/max rules.
    pub billable_seconds: i64,
    pub time_amount: Money,
    pub charges_total: Money,
    pub discount_amount: Money,
    pub total: Money,
}

/// Active seconds elapsed for `session` as of `now`.
///
/// Paused time is excluded entirely: completed pauses through
/// `accumulated_paused_ms`, a running pause by stopping the clock at
/// `paused_at`. A settled session stops at `end_time`.
pub fn elapsed_active_seconds(session: &Session, now: DateTime<Utc>) -> i64 {
    let clock_end = match session.status {
        SessionStatus::Active => now,
        SessionStatus::Paused => session.paused_at.unwrap_or(now),
        SessionStatus::Ended | SessionStatus::Finalized => session.end_time.unwrap_or(now),
    };

    let wall_ms = (clock_end - session.start_time).num_milliseconds();
    let active_ms = (wall_ms - session.accumulated_paused_ms).max(0);
    active_ms / 1000
}

/// Time-only amount for `elapsed_seconds` of active play under `tariff`.
///
/// Returns `(amount, free_seconds_used, billable_seconds)`.
pub fn time_amount(tariff: &Tariff, elapsed_seconds: i64) -> (Money, i64, i64) {
    let elapsed = elapsed_seconds.max(0);
    let min_seconds = tariff.min_duration_minutes.unwrap_or(0) as i64 * 60;

    match tariff.rate_type {
        RateType::Session => (tariff.rate, 0, elapsed),
        RateType::Fixed => {
            if elapsed >= min_seconds {
                (tariff.rate, 0, elapsed)
            } else {
                (Money::zero(), 0, 0)
            }
        }
        RateType::Hourly => {
            let billed = elapsed.max(min_seconds);
            let free_used = (tariff.free_minutes as i64 * 60).min(billed);
            let mut billable = billed - free_used;
            if let Some(max) = tariff.max_minutes() {
                billable = billable.min(max as i64 * 60);
            }
            (hourly_amount(tariff, billable), free_used, billable)
        }
    }
}

/// Prorates the hourly rate, walking tier bands when present.
///
/// Each band bills the minutes between the previous threshold and its own
/// at its rate. Minutes past the last threshold use the base rate.
fn hourly_amount(tariff: &Tariff, billable_seconds: i64) -> Money {
    if tariff.tiered_rates.is_empty() {
        return tariff.rate.prorate_hourly(billable_seconds);
    }

    let mut remaining = billable_seconds;
    let mut floor = 0_i64;
    let mut cent_seconds = 0_i128;

    for tier in &tariff.tiered_rates {
        if remaining == 0 {
            break;
        }
        let ceiling = tier.threshold_minutes as i64 * 60;
        let band = (ceiling - floor).clamp(0, remaining);
        cent_seconds += tier.rate.cents() as i128 * band as i128;
        remaining -= band;
        floor = ceiling;
    }

    cent_seconds += tariff.rate.cents() as i128 * remaining as i128;
    Money::from_cent_seconds(cent_seconds)
}

/// Full itemization of what `session` owes at `now` under `tariff`.
pub fn compute_breakdown(session: &Session, tariff: &Tariff, now: DateTime<Utc>) -> BillingBreakdown {
    let elapsed_seconds = elapsed_active_seconds(session, now);
    let (time_amount, free_seconds_used, billable_seconds) = time_amount(tariff, elapsed_seconds);

    let charges_total: Money = session.charges.iter().map(|c| c.line_total()).sum();
    let gross = time_amount + charges_total;

    let discount_amount = match session.discount {
        None => Money::zero(),
        Some(Discount::Percent { bps }) => gross.percentage_of(bps.min(10_000)),
        Some(Discount::Fixed { amount }) => amount.floor_zero().min(gross),
    };

    BillingBreakdown {
        elapsed_seconds,
        free_seconds_used,
        billable_seconds,
        time_amount,
        charges_total,
        discount_amount,
        total: (gross - discount_amount).floor_zero(),
    }
}

/// What `session` owes at `now` under `tariff`.
///
/// Deterministic and side-effect free: the same committed session and the
/// same instant always give the same cents.
pub fn compute_amount(session: &Session, tariff: &Tariff, now: DateTime<Utc>) -> Money {
    compute_breakdown(session, tariff, now).total
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TariffRestrictions, TieredRate, TimeRange};
    use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Weekday};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap()
    }

    fn hourly(rate_cents: i64, free_minutes: u32) -> Tariff {
        Tariff {
            id: "tariff-1".into(),
            name: "Evening".into(),
            rate: Money::from_cents(rate_cents),
            rate_type: RateType::Hourly,
            free_minutes,
            min_duration_minutes: None,
            max_duration_minutes: None,
            restrictions: TariffRestrictions::default(),
            tiered_rates: Vec::new(),
            is_active: true,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    fn session_with(tariff: &Tariff) -> Session {
        Session {
            id: "s1".into(),
            table_id: "t1".into(),
            tariff_id: tariff.id.clone(),
            tariff: tariff.clone(),
            status: SessionStatus::Active,
            player_count: 2,
            start_time: t0(),
            paused_at: None,
            pause_reason: None,
            accumulated_paused_ms: 0,
            end_time: None,
            frozen_amount: None,
            finalized_at: None,
            charges: Vec::new(),
            discount: None,
            notes: None,
            revision: 1,
        }
    }

    fn ctx(date: (i32, u32, u32), time: (u32, u32), players: u32) -> TariffContext {
        let local = NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, 0)
            .unwrap();
        TariffContext::new(local, players)
    }

    #[test]
    fn test_unpaused_hour_rate_with_free_minutes() {
        let tariff = hourly(1000, 10);
        let session = session_with(&tariff);

        let amount = compute_amount(&session, &tariff, t0() + Duration::minutes(25));
        assert_eq!(amount.cents(), 250);
        assert_eq!(amount.to_string(), "$2.50");
    }

    #[test]
    fn test_free_minutes_cover_short_sessions() {
        let tariff = hourly(1000, 10);
        let session = session_with(&tariff);

        let breakdown = compute_breakdown(&session, &tariff, t0() + Duration::minutes(7));
        assert_eq!(breakdown.total, Money::zero());
        assert_eq!(breakdown.free_seconds_used, 7 * 60);
        assert_eq!(breakdown.billable_seconds, 0);
    }

    #[test]
    fn test_running_pause_stops_the_clock() {
        let tariff = hourly(1000, 0);
        let mut session = session_with(&tariff);
        session.status = SessionStatus::Paused;
        session.paused_at = Some(t0() + Duration::minutes(30));

        let at_pause = compute_amount(&session, &tariff, t0() + Duration::minutes(30));
        let much_later = compute_amount(&session, &tariff, t0() + Duration::hours(5));
        assert_eq!(at_pause.cents(), 500);
        assert_eq!(much_later, at_pause);
    }

    #[test]
    fn test_accumulated_pause_is_excluded() {
        let tariff = hourly(1000, 0);
        let mut session = session_with(&tariff);
        session.accumulated_paused_ms = 30 * 60 * 1000;

        let amount = compute_amount(&session, &tariff, t0() + Duration::minutes(90));
        assert_eq!(amount.cents(), 1000);
    }

    #[test]
    fn test_min_duration_clamps_short_sessions() {
        let mut tariff = hourly(1200, 0);
        tariff.min_duration_minutes = Some(30);
        let session = session_with(&tariff);

        let amount = compute_amount(&session, &tariff, t0() + Duration::minutes(5));
        assert_eq!(amount.cents(), 600);
    }

    #[test]
    fn test_max_duration_caps_accrual() {
        let mut tariff = hourly(1000, 0);
        tariff.max_duration_minutes = Some(120);
        let session = session_with(&tariff);

        let at_cap = compute_amount(&session, &tariff, t0() + Duration::minutes(120));
        let past_cap = compute_amount(&session, &tariff, t0() + Duration::minutes(300));
        assert_eq!(at_cap.cents(), 2000);
        assert_eq!(past_cap, at_cap);
    }

    #[test]
    fn test_zero_max_duration_is_unlimited() {
        let mut tariff = hourly(1000, 0);
        tariff.max_duration_minutes = Some(0);
        let session = session_with(&tariff);

        let amount = compute_amount(&session, &tariff, t0() + Duration::hours(3));
        assert_eq!(amount.cents(), 3000);
    }

    #[test]
    fn test_tiered_rates_bill_marginal_bands() {
        let mut tariff = hourly(600, 0);
        tariff.tiered_rates = vec![
            TieredRate {
                threshold_minutes: 60,
                rate: Money::from_cents(1200),
            },
            TieredRate {
                threshold_minutes: 120,
                rate: Money::from_cents(900),
            },
        ];
        let session = session_with(&tariff);

        // 60 min @ 12.00 + 60 min @ 9.00 + 30 min @ 6.00 (base)
        let amount = compute_amount(&session, &tariff, t0() + Duration::minutes(150));
        assert_eq!(amount.cents(), 1200 + 900 + 300);

        // Inside the first band only
        let amount = compute_amount(&session, &tariff, t0() + Duration::minutes(30));
        assert_eq!(amount.cents(), 600);
    }

    #[test]
    fn test_fixed_rate_waits_for_min_duration() {
        let mut tariff = hourly(1500, 0);
        tariff.rate_type = RateType::Fixed;
        tariff.min_duration_minutes = Some(20);
        let session = session_with(&tariff);

        assert_eq!(
            compute_amount(&session, &tariff, t0() + Duration::minutes(19)),
            Money::zero()
        );
        assert_eq!(
            compute_amount(&session, &tariff, t0() + Duration::minutes(20)).cents(),
            1500
        );
        assert_eq!(
            compute_amount(&session, &tariff, t0() + Duration::hours(4)).cents(),
            1500
        );
    }

    #[test]
    fn test_session_rate_is_flat_from_start() {
        let mut tariff = hourly(800, 0);
        tariff.rate_type = RateType::Session;
        let session = session_with(&tariff);

        assert_eq!(compute_amount(&session, &tariff, t0()).cents(), 800);
        assert_eq!(
            compute_amount(&session, &tariff, t0() + Duration::hours(2)).cents(),
            800
        );
    }

    #[test]
    fn test_amount_is_monotonic_in_elapsed_time() {
        let mut tariff = hourly(1337, 7);
        tariff.tiered_rates = vec![TieredRate {
            threshold_minutes: 45,
            rate: Money::from_cents(2000),
        }];
        let session = session_with(&tariff);

        let mut previous = Money::zero();
        for second in (0..4 * 3600).step_by(17) {
            let amount = compute_amount(&session, &tariff, t0() + Duration::seconds(second));
            assert!(amount >= previous, "amount decreased at {second}s");
            previous = amount;
        }
    }

    #[test]
    fn test_charges_and_discounts() {
        let tariff = hourly(1000, 0);
        let mut session = session_with(&tariff);
        session.charges.push(crate::types::SessionCharge {
            id: "c1".into(),
            name: "Soda".into(),
            unit_price: Money::from_cents(250),
            quantity: 2,
        });
        session.discount = Some(Discount::Percent { bps: 1000 });

        // 1000 time + 500 charges = 1500, minus 10%
        let breakdown = compute_breakdown(&session, &tariff, t0() + Duration::hours(1));
        assert_eq!(breakdown.charges_total.cents(), 500);
        assert_eq!(breakdown.discount_amount.cents(), 150);
        assert_eq!(breakdown.total.cents(), 1350);

        session.discount = Some(Discount::Fixed {
            amount: Money::from_cents(99_999),
        });
        let breakdown = compute_breakdown(&session, &tariff, t0() + Duration::hours(1));
        assert_eq!(breakdown.total, Money::zero());
    }

    #[test]
    fn test_resolve_rejects_inactive_tariff() {
        let mut tariff = hourly(1000, 0);
        tariff.is_active = false;

        let err = resolve(&tariff, &ctx((2024, 3, 1), (18, 0), 2)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTariff { .. }));
    }

    #[test]
    fn test_resolve_checks_day_and_time() {
        let mut tariff = hourly(1000, 0);
        tariff.restrictions.days_of_week = vec![Weekday::Fri, Weekday::Sat];
        tariff.restrictions.time_ranges = vec![TimeRange::new(
            NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        )];

        // 2024-03-01 is a Friday
        assert!(resolve(&tariff, &ctx((2024, 3, 1), (20, 0), 2)).is_ok());
        assert!(resolve(&tariff, &ctx((2024, 3, 2), (1, 30), 2)).is_ok());
        assert!(resolve(&tariff, &ctx((2024, 3, 1), (12, 0), 2)).is_err());
        // Sunday
        assert!(resolve(&tariff, &ctx((2024, 3, 3), (20, 0), 2)).is_err());
    }

    #[test]
    fn test_resolve_checks_player_bounds() {
        let mut tariff = hourly(1000, 0);
        tariff.restrictions.min_players = Some(2);
        tariff.restrictions.max_players = Some(4);

        assert!(resolve(&tariff, &ctx((2024, 3, 1), (18, 0), 1)).is_err());
        assert!(resolve(&tariff, &ctx((2024, 3, 1), (18, 0), 3)).is_ok());
        assert!(resolve(&tariff, &ctx((2024, 3, 1), (18, 0), 5)).is_err());
    }

    #[test]
    fn test_context_applies_venue_offset() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let ctx = TariffContext::at(t0(), offset, 2);
        assert_eq!(ctx.local_time.time(), NaiveTime::from_hms_opt(20, 0, 0).unwrap());
    }

    #[test]
    fn test_validate_tariff() {
        assert!(validate_tariff(&hourly(1000, 10)).is_ok());

        let mut bad = hourly(-1, 0);
        assert!(validate_tariff(&bad).is_err());

        bad = hourly(1000, 0);
        bad.min_duration_minutes = Some(90);
        bad.max_duration_minutes = Some(60);
        assert!(validate_tariff(&bad).is_err());

        bad = hourly(1000, 0);
        bad.tiered_rates = vec![
            TieredRate {
                threshold_minutes: 60,
                rate: Money::from_cents(900),
            },
            TieredRate {
                threshold_minutes: 60,
                rate: Money::from_cents(800),
            },
        ];
        assert!(validate_tariff(&bad).is_err());
    }
}
