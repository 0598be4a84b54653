//! # Validation Module
//!
//! Input validation utilities for Cue Hall.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Terminal UI (TypeScript)                                     │
//! │  └── Immediate feedback on empty names, bad PIN length                 │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: hall-server (Rust)                                           │
//! │  ├── Type validation (serde deserialization)                           │
//! │  └── THIS MODULE: domain rule validation                               │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  └── NOT NULL / CHECK constraints                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::{MAX_CHARGE_QUANTITY, MAX_TABLE_CAPACITY, PIN_MAX_LEN, PIN_MIN_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// String Validators
// =============================================================================

fn validate_text(field: &str, value: &str, max: usize) -> ValidationResult<()> {
    let value = value.trim();

    if value.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.chars().count() > max {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max,
        });
    }

    Ok(())
}

/// Validates a table display name (1-50 characters).
///
/// ```rust
/// use cue_core::validation::validate_table_name;
///
/// assert!(validate_table_name("Snooker A").is_ok());
/// assert!(validate_table_name("  ").is_err());
/// ```
pub fn validate_table_name(name: &str) -> ValidationResult<()> {
    validate_text("name", name, 50)
}

/// Validates a floor-plan room id (1-64 characters, no `*`).
pub fn validate_room(room: &str) -> ValidationResult<()> {
    validate_text("room", room, 64)?;

    if room.contains('*') {
        return Err(ValidationError::InvalidFormat {
            field: "room".to_string(),
            reason: "'*' is reserved for all rooms".to_string(),
        });
    }

    Ok(())
}

/// Validates an add-on charge name (1-100 characters).
pub fn validate_charge_name(name: &str) -> ValidationResult<()> {
    validate_text("charge name", name, 100)
}

/// Validates a manager PIN: digits only, 4 to 8 long.
///
/// ```rust
/// use cue_core::validation::validate_pin_format;
///
/// assert!(validate_pin_format("4821").is_ok());
/// assert!(validate_pin_format("12a4").is_err());
/// assert!(validate_pin_format("12").is_err());
/// ```
pub fn validate_pin_format(pin: &str) -> ValidationResult<()> {
    if pin.is_empty() {
        return Err(ValidationError::Required {
            field: "pin".to_string(),
        });
    }

    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: "pin".to_string(),
            reason: "must contain only digits".to_string(),
        });
    }

    if pin.len() < PIN_MIN_LEN || pin.len() > PIN_MAX_LEN {
        return Err(ValidationError::OutOfRange {
            field: "pin length".to_string(),
            min: PIN_MIN_LEN as i64,
            max: PIN_MAX_LEN as i64,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a table capacity (1 to MAX_TABLE_CAPACITY).
pub fn validate_capacity(capacity: u32) -> ValidationResult<()> {
    if capacity == 0 || capacity > MAX_TABLE_CAPACITY {
        return Err(ValidationError::OutOfRange {
            field: "capacity".to_string(),
            min: 1,
            max: MAX_TABLE_CAPACITY as i64,
        });
    }

    Ok(())
}

/// Validates the player count for a session on a table of `capacity`.
///
/// ## User Workflow
/// ```text
/// Start session on "Table 2" (capacity 4)
///      │
///      ├── players = 0 → Error: "players must be positive"
///      ├── players = 6 → Error: "players must be between 1 and 4"
///      └── players = 3 → OK
/// ```
pub fn validate_player_count(players: u32, capacity: u32) -> ValidationResult<()> {
    if players == 0 {
        return Err(ValidationError::MustBePositive {
            field: "players".to_string(),
        });
    }

    if players > capacity {
        return Err(ValidationError::OutOfRange {
            field: "players".to_string(),
            min: 1,
            max: capacity as i64,
        });
    }

    Ok(())
}

/// Validates an add-on quantity (1 to MAX_CHARGE_QUANTITY).
pub fn validate_quantity(qty: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > MAX_CHARGE_QUANTITY {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_CHARGE_QUANTITY,
        });
    }

    Ok(())
}

/// Validates a price in cents. Zero is allowed (complimentary items).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

/// Validates a percentage discount in basis points (0 to 10000).
pub fn validate_discount_bps(bps: u32) -> ValidationResult<()> {
    if bps > 10000 {
        return Err(ValidationError::OutOfRange {
            field: "discount".to_string(),
            min: 0,
            max: 10000,
        });
    }

    Ok(())
}

// =============================================================================
// UUID Validators
// =============================================================================

/// Validates a UUID string format.
pub fn validate_uuid(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    uuid::Uuid::parse_str(id).map_err(|_| ValidationError::InvalidFormat {
        field: "id".to_string(),
        reason: "must be a valid UUID".to_string(),
    })?;

    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("Table 1").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name(&"A".repeat(51)).is_err());
    }

    #[test]
    fn test_validate_room() {
        assert!(validate_room("main-floor").is_ok());
        assert!(validate_room("*").is_err());
        assert!(validate_room("").is_err());
    }

    #[test]
    fn test_validate_pin_format() {
        assert!(validate_pin_format("1234").is_ok());
        assert!(validate_pin_format("12345678").is_ok());
        assert!(validate_pin_format("").is_err());
        assert!(validate_pin_format("123").is_err());
        assert!(validate_pin_format("123456789").is_err());
        assert!(validate_pin_format("12 4").is_err());
    }

    #[test]
    fn test_validate_capacity() {
        assert!(validate_capacity(1).is_ok());
        assert!(validate_capacity(MAX_TABLE_CAPACITY).is_ok());
        assert!(validate_capacity(0).is_err());
        assert!(validate_capacity(MAX_TABLE_CAPACITY + 1).is_err());
    }

    #[test]
    fn test_validate_player_count() {
        assert!(validate_player_count(1, 4).is_ok());
        assert!(validate_player_count(4, 4).is_ok());
        assert!(validate_player_count(0, 4).is_err());
        assert_eq!(
            validate_player_count(5, 4).unwrap_err().to_string(),
            "players must be between 1 and 4"
        );
    }

    #[test]
    fn test_validate_quantity_and_price() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(0).is_err());
        assert!(validate_quantity(MAX_CHARGE_QUANTITY + 1).is_err());
        assert!(validate_price_cents(0).is_ok());
        assert!(validate_price_cents(-1).is_err());
    }

    #[test]
    fn test_validate_discount_bps() {
        assert!(validate_discount_bps(10000).is_ok());
        assert!(validate_discount_bps(10001).is_err());
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_uuid("").is_err());
        assert!(validate_uuid("not-a-uuid").is_err());
    }
}
