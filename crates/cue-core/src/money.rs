//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  A table billed at $10.00/h for 10 minutes:                             │
//! │    10.0 * (10.0 / 60.0) = 1.6666666666666667                            │
//! │                                                                         │
//! │  Every terminal recomputes the live amount every second. Float drift   │
//! │  means two terminals can show $1.66 and $1.67 for the same session.    │
//! │                                                                         │
//! │  OUR SOLUTION: Integer Cents + one rounding step                        │
//! │    1000 cents/h × 600 s = 600_000 cent-seconds                          │
//! │    (600_000 + 1800) / 3600 = 167 cents                                  │
//! │    Same inputs, same cents, on every machine                            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use cue_core::money::Money;
//!
//! let rate = Money::from_cents(1000); // $10.00 per hour
//! let owed = rate.prorate_hourly(600); // 10 minutes
//! assert_eq!(owed.cents(), 167);
//! assert_eq!(owed.to_string(), "$1.67");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use ts_rs::TS;

/// Seconds in one billing hour.
pub const SECONDS_PER_HOUR: i64 = 3600;

// =============================================================================
// Money Type
// =============================================================================

/// Represents a monetary value in the smallest currency unit (cents).
///
/// ## Where Money is Used
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  Tariff.rate ──┬──► compute_amount(elapsed) ──► Session.frozen_amount  │
/// │                │                                                        │
/// │  Charge.unit_price × qty ──► charges total ──┘                          │
/// │                                                                         │
/// │  Discount (percent or fixed) ──► subtracted, floored at $0.00          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents (the smallest currency unit).
    ///
    /// ```rust
    /// use cue_core::money::Money;
    ///
    /// let rate = Money::from_cents(1250); // $12.50
    /// assert_eq!(rate.cents(), 1250);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Creates a Money value from major and minor units (dollars and cents).
    ///
    /// For negative amounts, only the major unit should be negative.
    /// `from_major_minor(-5, 50)` = -$5.50
    #[inline]
    pub const fn from_major_minor(major: i64, minor: i64) -> Self {
        if major < 0 {
            Money(major * 100 - minor)
        } else {
            Money(major * 100 + minor)
        }
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the major unit (dollars) portion.
    #[inline]
    pub const fn dollars(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the minor unit (cents) portion (always 0-99).
    #[inline]
    pub const fn cents_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Clamps negative values to zero.
    ///
    /// A session total can never be owed back to the player, even when a
    /// fixed discount exceeds the time and add-on charges.
    #[inline]
    pub const fn floor_zero(self) -> Self {
        if self.0 < 0 {
            Money(0)
        } else {
            self
        }
    }

    /// Prorates an hourly rate over `seconds` of billable time.
    ///
    /// ## Rounding
    /// Half-up to the nearest cent, computed once in i128:
    /// `(rate_cents × seconds + 1800) / 3600`
    ///
    /// ```rust
    /// use cue_core::money::Money;
    ///
    /// let rate = Money::from_cents(1000);
    /// assert_eq!(rate.prorate_hourly(900).cents(), 250); // 15 min
    /// assert_eq!(rate.prorate_hourly(0).cents(), 0);
    /// ```
    pub fn prorate_hourly(&self, seconds: i64) -> Money {
        Money::from_cent_seconds(self.0 as i128 * seconds.max(0) as i128)
    }

    /// Converts an accumulated `cents × seconds` product into cents per hour,
    /// rounding half-up.
    ///
    /// Used when several rate bands are summed before the single rounding
    /// step, so the total never depends on how the bands were split.
    pub fn from_cent_seconds(cent_seconds: i128) -> Money {
        let hour = SECONDS_PER_HOUR as i128;
        let rounded = if cent_seconds >= 0 {
            (cent_seconds + hour / 2) / hour
        } else {
            (cent_seconds - hour / 2) / hour
        };
        Money::from_cents(rounded as i64)
    }

    /// Multiplies money by a quantity.
    ///
    /// ```rust
    /// use cue_core::money::Money;
    ///
    /// let chalk = Money::from_cents(150);
    /// assert_eq!(chalk.multiply_quantity(3).cents(), 450);
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }

    /// Returns the portion of this amount covered by a percentage discount.
    ///
    /// ## Arguments
    /// * `discount_bps` - Discount in basis points (1000 = 10%)
    pub fn percentage_of(&self, discount_bps: u32) -> Money {
        let portion = (self.0 as i128 * discount_bps as i128 + 5000) / 10000;
        Money::from_cents(portion as i64)
    }

    /// Applies a percentage discount and returns the discounted amount.
    ///
    /// ```rust
    /// use cue_core::money::Money;
    ///
    /// let total = Money::from_cents(10000);
    /// assert_eq!(total.apply_percentage_discount(1000).cents(), 9000);
    /// ```
    pub fn apply_percentage_discount(&self, discount_bps: u32) -> Money {
        *self - self.percentage_of(discount_bps)
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Shows money as `$2.50`; terminals localize on their side.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(
            f,
            "{}${}.{:02}",
            sign,
            self.dollars().abs(),
            self.cents_part()
        )
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), |acc, m| acc + m)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
