//! # Access Policy
//!
//! Roles, permissions, and the elevation rule for sensitive table actions.
//!
//! ## Elevation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Staff terminal: end(T3)                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  requires_elevation(End, Staff) == true                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Server parks the action ──► Unauthorized { pending_id }                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Manager enters PIN ──► verify(pending_id, pin)                         │
//! │       │                                                                 │
//! │       ├── ok      ──► original end(T3) runs exactly once                │
//! │       ├── wrong   ──► attempt counted, action stays parked              │
//! │       └── cancel / timeout ──► action discarded, nothing changed        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Roles & Permissions
// =============================================================================

/// Staff role, as asserted by the external identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    /// Admins and managers never need a PIN.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Admin | Role::Manager)
    }

    /// Checks a permission against this role's default set.
    pub fn has_permission(&self, permission: &str) -> bool {
        let granted = default_permissions(*self);
        granted.contains(&permission) || granted.contains(&permissions::ALL)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "staff" | "user" => Ok(Role::Staff),
            other => Err(ValidationError::InvalidFormat {
                field: "role".to_string(),
                reason: format!("unknown role '{other}'"),
            }),
        }
    }
}

/// Permission names.
pub mod permissions {
    pub const ALL: &str = "all";
    pub const TABLES_READ: &str = "tables:read";
    pub const TABLES_MANAGE: &str = "tables:manage";
    pub const SESSIONS_OPERATE: &str = "sessions:operate";
    pub const SESSIONS_SETTLE: &str = "sessions:settle";
    pub const SESSIONS_DISCOUNT: &str = "sessions:discount";
    pub const TARIFFS_MANAGE: &str = "tariffs:manage";
    pub const LAYOUTS_ACTIVATE: &str = "layouts:activate";
}

const ADMIN_PERMISSIONS: &[&str] = &[permissions::ALL];

const MANAGER_PERMISSIONS: &[&str] = &[
    permissions::TABLES_READ,
    permissions::TABLES_MANAGE,
    permissions::SESSIONS_OPERATE,
    permissions::SESSIONS_SETTLE,
    permissions::SESSIONS_DISCOUNT,
    permissions::TARIFFS_MANAGE,
    permissions::LAYOUTS_ACTIVATE,
];

const STAFF_PERMISSIONS: &[&str] = &[permissions::TABLES_READ, permissions::SESSIONS_OPERATE];

/// Default permissions for a role.
pub fn default_permissions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Admin => ADMIN_PERMISSIONS,
        Role::Manager => MANAGER_PERMISSIONS,
        Role::Staff => STAFF_PERMISSIONS,
    }
}

// =============================================================================
// Table Actions
// =============================================================================

/// A mutating action a terminal can issue against a table.
///
/// Held verbatim in the pending queue while a PIN is collected, then
/// replayed unchanged once verification succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TableAction {
    #[serde(rename_all = "camelCase")]
    Start {
        table_id: String,
        tariff_id: String,
        player_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    Pause {
        table_id: String,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Resume { table_id: String },
    #[serde(rename_all = "camelCase")]
    End { table_id: String },
    #[serde(rename_all = "camelCase")]
    Finalize { table_id: String },
    #[serde(rename_all = "camelCase")]
    Clean { table_id: String },
    #[serde(rename_all = "camelCase")]
    Delete { table_id: String },
}

impl TableAction {
    pub fn table_id(&self) -> &str {
        match self {
            TableAction::Start { table_id, .. }
            | TableAction::Pause { table_id, .. }
            | TableAction::Resume { table_id }
            | TableAction::End { table_id }
            | TableAction::Finalize { table_id }
            | TableAction::Clean { table_id }
            | TableAction::Delete { table_id } => table_id,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            TableAction::Start { .. } => ActionKind::Start,
            TableAction::Pause { .. } => ActionKind::Pause,
            TableAction::Resume { .. } => ActionKind::Resume,
            TableAction::End { .. } => ActionKind::End,
            TableAction::Finalize { .. } => ActionKind::Finalize,
            TableAction::Clean { .. } => ActionKind::Clean,
            TableAction::Delete { .. } => ActionKind::Delete,
        }
    }
}

/// The verb of a [`TableAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Start,
    Pause,
    Resume,
    End,
    Finalize,
    Clean,
    Delete,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Pause => "pause",
            ActionKind::Resume => "resume",
            ActionKind::End => "end",
            ActionKind::Finalize => "finalize",
            ActionKind::Clean => "clean",
            ActionKind::Delete => "delete",
        }
    }

    /// Elevation needed before anyone may perform this action.
    pub fn required_elevation(&self) -> Elevation {
        match self {
            ActionKind::End | ActionKind::Finalize | ActionKind::Delete => Elevation::Manager,
            _ => Elevation::None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Elevation level an action demands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum Elevation {
    None,
    /// A manager/admin role, or a freshly verified manager PIN.
    Manager,
}

/// True when `role` must supply a PIN before `kind` may run.
pub fn requires_elevation(kind: ActionKind, role: Role) -> bool {
    kind.required_elevation() == Elevation::Manager && !role.is_elevated()
}

/// Authorizes `kind` for `role`, unless a verified PIN grant is presented.
///
/// ## Errors
/// `Unauthorized` (without a pending id) when elevation is missing.
pub fn authorize(kind: ActionKind, role: Role, pin_verified: bool) -> CoreResult<()> {
    if requires_elevation(kind, role) && !pin_verified {
        return Err(CoreError::unauthorized(kind.as_str()));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_actions_require_elevation_for_staff() {
        for kind in [ActionKind::End, ActionKind::Finalize, ActionKind::Delete] {
            assert!(requires_elevation(kind, Role::Staff));
            assert!(!requires_elevation(kind, Role::Manager));
            assert!(!requires_elevation(kind, Role::Admin));
        }
        for kind in [
            ActionKind::Start,
            ActionKind::Pause,
            ActionKind::Resume,
            ActionKind::Clean,
        ] {
            assert!(!requires_elevation(kind, Role::Staff));
        }
    }

    #[test]
    fn test_authorize_with_pin_grant() {
        assert!(matches!(
            authorize(ActionKind::End, Role::Staff, false),
            Err(CoreError::Unauthorized { .. })
        ));
        assert!(authorize(ActionKind::End, Role::Staff, true).is_ok());
        assert!(authorize(ActionKind::Pause, Role::Staff, false).is_ok());
    }

    #[test]
    fn test_role_permissions() {
        assert!(Role::Admin.has_permission(permissions::TARIFFS_MANAGE));
        assert!(Role::Manager.has_permission(permissions::TABLES_MANAGE));
        assert!(Role::Staff.has_permission(permissions::SESSIONS_OPERATE));
        assert!(!Role::Staff.has_permission(permissions::TARIFFS_MANAGE));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Manager".parse::<Role>().unwrap(), Role::Manager);
        assert_eq!("user".parse::<Role>().unwrap(), Role::Staff);
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_action_wire_format() {
        let action = TableAction::Start {
            table_id: "t1".into(),
            tariff_id: "tariff-1".into(),
            player_count: 2,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "start");
        assert_eq!(json["tableId"], "t1");
        assert_eq!(json["playerCount"], 2);

        let parsed: TableAction =
            serde_json::from_str(r#"{"action":"end","tableId":"t9"}"#).unwrap();
        assert_eq!(parsed.kind(), ActionKind::End);
        assert_eq!(parsed.table_id(), "t9");
    }
}
