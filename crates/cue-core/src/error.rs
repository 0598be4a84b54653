//! # Error Types
//!
//! Domain-specific error types for cue-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cue-core errors (this file)                                           │
//! │  ├── CoreError        - Rejection taxonomy for table/session actions    │
//! │  ├── RejectReason     - Wire code carried to terminals                  │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  cue-db errors        └── DbError    - Database operation failures     │
//! │  cue-sync errors      └── SyncError  - Transport / protocol failures   │
//! │  hall-server          └── ApiError   - What terminals receive          │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → ApiError { code } → notice        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation Rules
//! - `Conflict`, `InvalidTransition`, `InvalidTariff`: rejected immediately,
//!   terminal reverts its optimistic view
//! - `NetworkFailure`: only idempotent reads are retried automatically
//! - `Unauthorized`: starts the PIN elevation flow, not a hard failure

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use ts_rs::TS;

// =============================================================================
// Core Error
// =============================================================================

/// Rejections produced by table, session, tariff and access operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    /// The table is already in use, or another action on it is in flight.
    ///
    /// ## When This Occurs
    /// - `start` on a table that is not `available`
    /// - A second mutating action on a table whose first action has not
    ///   resolved yet (rejected outright, never queued)
    /// - Deleting a table that still holds a session
    ///
    /// ## User Workflow
    /// ```text
    /// Terminal A: start(T3) ──► commits, T3 occupied
    /// Terminal B: start(T3) ──► Conflict { "table is occupied" }
    ///      │
    ///      ▼
    /// B snaps T3 back to the server's view and shows a notice
    /// ```
    #[error("Conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: String,
        id: String,
        reason: String,
    },

    /// The requested action is not an edge of the session/table graph.
    ///
    /// ## When This Occurs
    /// - `pause` on an Ended session
    /// - `resume` on an Active session
    /// - `clean` on a table that is not cleaning
    #[error("Cannot {action} {entity} {id} while {from}")]
    InvalidTransition {
        entity: String,
        id: String,
        from: String,
        action: String,
    },

    /// The tariff cannot be applied at session start, or its definition is
    /// malformed.
    #[error("Tariff {tariff_id} is not applicable: {reason}")]
    InvalidTariff { tariff_id: String, reason: String },

    /// Too many failed PIN attempts inside the rate-limit window.
    #[error("Too many PIN attempts, retry in {retry_after_secs}s")]
    TooManyAttempts { retry_after_secs: u64 },

    /// Transient transport failure. Safe to retry only for reads.
    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// The caller lacks the role for this action.
    ///
    /// `pending_id` is set when the action was parked behind the PIN flow.
    #[error("{action} requires manager approval")]
    Unauthorized {
        action: String,
        pending_id: Option<String>,
    },

    /// Entity cannot be found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A rejection relayed from the hall server, already rendered.
    #[error("{message}")]
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl CoreError {
    pub fn conflict(
        entity: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        CoreError::Conflict {
            entity: entity.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(
        entity: impl Into<String>,
        id: impl Into<String>,
        from: impl fmt::Display,
        action: impl Into<String>,
    ) -> Self {
        CoreError::InvalidTransition {
            entity: entity.into(),
            id: id.into(),
            from: from.to_string(),
            action: action.into(),
        }
    }

    pub fn invalid_tariff(tariff_id: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::InvalidTariff {
            tariff_id: tariff_id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn unauthorized(action: impl Into<String>) -> Self {
        CoreError::Unauthorized {
            action: action.into(),
            pending_id: None,
        }
    }

    /// Returns the taxonomy reason sent to terminals.
    pub fn reason(&self) -> RejectReason {
        match self {
            CoreError::Conflict { .. } => RejectReason::Conflict,
            CoreError::InvalidTransition { .. } => RejectReason::InvalidTransition,
            CoreError::InvalidTariff { .. } => RejectReason::InvalidTariff,
            CoreError::TooManyAttempts { .. } => RejectReason::TooManyAttempts,
            CoreError::NetworkFailure(_) => RejectReason::NetworkFailure,
            CoreError::Unauthorized { .. } => RejectReason::Unauthorized,
            CoreError::NotFound { .. } => RejectReason::NotFound,
            CoreError::Validation(_) => RejectReason::Validation,
            CoreError::Rejected { reason, .. } => *reason,
        }
    }

    /// Checks if the failed call may be retried automatically.
    ///
    /// Only transport failures qualify, and callers must still restrict
    /// retries to idempotent reads.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::NetworkFailure(_))
    }
}

// =============================================================================
// Reject Reason
// =============================================================================

/// Wire-level reason code for a rejected action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Conflict,
    InvalidTransition,
    InvalidTariff,
    TooManyAttempts,
    NetworkFailure,
    Unauthorized,
    NotFound,
    Validation,
    /// The action did not resolve before the terminal's deadline.
    Timeout,
}

impl RejectReason {
    /// Stable code string, identical to the serde form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Conflict => "conflict",
            RejectReason::InvalidTransition => "invalid_transition",
            RejectReason::InvalidTariff => "invalid_tariff",
            RejectReason::TooManyAttempts => "too_many_attempts",
            RejectReason::NetworkFailure => "network_failure",
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::NotFound => "not_found",
            RejectReason::Validation => "validation",
            RejectReason::Timeout => "timeout",
        }
    }

    /// Parses a wire code back into a reason.
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "conflict" => RejectReason::Conflict,
            "invalid_transition" => RejectReason::InvalidTransition,
            "invalid_tariff" => RejectReason::InvalidTariff,
            "too_many_attempts" => RejectReason::TooManyAttempts,
            "network_failure" => RejectReason::NetworkFailure,
            "unauthorized" => RejectReason::Unauthorized,
            "not_found" => RejectReason::NotFound,
            "validation" => RejectReason::Validation,
            "timeout" => RejectReason::Timeout,
            _ => return None,
        })
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when user input doesn't meet requirements.
/// Used for early validation before any state is touched.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., invalid UUID, non-numeric PIN).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::conflict("table", "T3", "table is occupied");
        assert_eq!(err.to_string(), "Conflict on table T3: table is occupied");

        let err = CoreError::invalid_transition("session", "S1", "ended", "pause");
        assert_eq!(err.to_string(), "Cannot pause session S1 while ended");

        let err = CoreError::unauthorized("end");
        assert_eq!(err.to_string(), "end requires manager approval");

        let err = CoreError::Rejected {
            reason: RejectReason::InvalidTransition,
            message: "Cannot resume session S1 while active".into(),
        };
        assert_eq!(err.to_string(), "Cannot resume session S1 while active");
        assert_eq!(err.reason(), RejectReason::InvalidTransition);
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            CoreError::conflict("table", "T1", "busy").reason(),
            RejectReason::Conflict
        );
        assert_eq!(
            CoreError::TooManyAttempts { retry_after_secs: 30 }
                .reason()
                .as_str(),
            "too_many_attempts"
        );
        assert_eq!(
            serde_json::to_string(&RejectReason::InvalidTariff).unwrap(),
            "\"invalid_tariff\""
        );
    }

    #[test]
    fn test_reason_code_parse() {
        for reason in [
            RejectReason::Conflict,
            RejectReason::InvalidTransition,
            RejectReason::Unauthorized,
            RejectReason::Timeout,
        ] {
            assert_eq!(RejectReason::from_code(reason.as_str()), Some(reason));
        }
        assert_eq!(RejectReason::from_code("teapot"), None);
    }

    #[test]
    fn test_only_network_failures_are_retryable() {
        assert!(CoreError::NetworkFailure("reset".into()).is_retryable());
        assert!(!CoreError::conflict("table", "T1", "busy").is_retryable());
        assert!(!CoreError::unauthorized("end").is_retryable());
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "name".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
        assert_eq!(core_err.reason(), RejectReason::Validation);
    }
}
