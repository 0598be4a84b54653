//! # cue-core: Pure Domain Logic for Cue Hall
//!
//! This crate is the **heart** of Cue Hall. It contains the tariff engine,
//! the session state machine and the elevation policy as pure functions
//! with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Cue Hall Architecture                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Staff Terminals (floor-plan UI)                 │   │
//! │  │   optimistic view ◄── TerminalCache (cue-sync) ◄── broadcasts   │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ REST actions + /ws                     │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    hall-server                                  │   │
//! │  │   Access Guard ──► Session Manager ──► Sync Hub                 │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ cue-core (THIS CRATE) ★                         │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐          │   │
//! │  │   │  types   │ │  tariff  │ │ session  │ │  access  │          │   │
//! │  │   │  Table   │ │ resolve  │ │ start    │ │  Role    │          │   │
//! │  │   │  Session │ │ compute_ │ │ pause    │ │  Action  │          │   │
//! │  │   │  Tariff  │ │  amount  │ │ end ...  │ │ elevation│          │   │
//! │  │   └──────────┘ └──────────┘ └──────────┘ └──────────┘          │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • NO WALL CLOCK             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Table, Session, Tariff, statuses)
//! - [`money`] - Money type with integer arithmetic
//! - [`tariff`] - Tariff resolution and amount computation
//! - [`session`] - Session state machine transitions
//! - [`table`] - Table status guards and manual actions
//! - [`access`] - Roles, permissions, elevation rule
//! - [`error`] - Rejection taxonomy
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use cue_core::{Money, RateType, Session, Table, Tariff, TariffRestrictions};
//!
//! let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
//! let table = Table::new("Table 1", 4, "main", t0).unwrap();
//! let tariff = Tariff {
//!     id: "std".into(),
//!     name: "Standard".into(),
//!     rate: Money::from_cents(1000),
//!     rate_type: RateType::Hourly,
//!     free_minutes: 10,
//!     min_duration_minutes: None,
//!     max_duration_minutes: None,
//!     restrictions: TariffRestrictions::default(),
//!     tiered_rates: vec![],
//!     is_active: true,
//!     created_at: t0,
//!     updated_at: t0,
//! };
//!
//! let session = Session::start(&table, tariff, 2, t0).unwrap();
//! let owed = session.current_amount(t0 + Duration::minutes(25));
//! assert_eq!(owed.to_string(), "$2.50");
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod access;
pub mod error;
pub mod money;
pub mod session;
pub mod table;
pub mod tariff;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use access::{ActionKind, Elevation, Role, TableAction};
pub use error::{CoreError, CoreResult, RejectReason, ValidationError};
pub use money::Money;
pub use session::{FinalizeOutcome, SessionView};
pub use tariff::{BillingBreakdown, TariffContext};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Largest table a venue can configure.
pub const MAX_TABLE_CAPACITY: u32 = 12;

/// Maximum quantity on a single add-on line.
///
/// ## Business Reason
/// Catches fat-finger entries (100 instead of 1) at the bar.
pub const MAX_CHARGE_QUANTITY: i64 = 99;

/// Manager PIN length bounds.
pub const PIN_MIN_LEN: usize = 4;
pub const PIN_MAX_LEN: usize = 8;

/// Room id that subscribes a terminal to every floor-plan room.
pub const ALL_ROOMS: &str = "*";
