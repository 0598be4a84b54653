//! # Hall Server
//!
//! The authoritative server for a billiard hall's tables and billing
//! sessions.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Hall Server Services                            │
//! │                                                                         │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────────┐│
//! │  │  AccessGuard   │  │ SessionManager │  │  TableRegistry             ││
//! │  │                │  │                │  │                            ││
//! │  │ • admit/park   │  │ • start, pause │  │ • create, update           ││
//! │  │ • verify PIN   │  │ • resume, end  │  │ • clean, maintenance       ││
//! │  │ • rate limit   │  │ • finalize     │  │ • delete (soft)            ││
//! │  └────────────────┘  └────────────────┘  └────────────────────────────┘│
//! │           │                   │                        │               │
//! │           ▼                   ▼                        ▼               │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Floor: per-table lease ──► SQLite commit ──► swap ──► publish   │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │                       Hub (/ws, rooms, snapshots)                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//! See [`config::HallConfig`]. Environment overrides:
//! - `CUE_PORT`, `CUE_BIND_ADDR` - Listener
//! - `CUE_DATABASE_PATH` - SQLite file
//! - `CUE_JWT_SECRET` - Secret shared with the identity provider
//! - `CUE_PIN_HASHES` - `;`-separated argon2 hashes of manager PINs
//! - `CUE_UTC_OFFSET_MINUTES` - Venue clock for tariff restrictions
//! - `CUE_LOG_LEVEL` - Tracing filter when `RUST_LOG` is unset

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use cue_core::TableAction;
use cue_db::Database;
use cue_sync::HubHandle;

// Re-exports
pub use auth::{Caller, JwtManager};
pub use config::HallConfig;
pub use error::{ApiError, ApiResult};
pub use state::ActionResult;

use state::{AccessGuard, Floor, FloorBackend, FloorState, SessionManager, TableRegistry, Verification};

/// How often expired pending actions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Shared application state.
pub struct AppState {
    pub config: HallConfig,
    pub db: Database,
    pub hub: HubHandle,
    pub floor: Arc<Floor>,
    pub tables: TableRegistry,
    pub sessions: SessionManager,
    pub guard: Arc<AccessGuard>,
    pub jwt: JwtManager,
}

impl AppState {
    /// Loads the floor from `db` and wires the services and the hub.
    pub async fn new(config: HallConfig, db: Database) -> ApiResult<Arc<Self>> {
        let jwt = JwtManager::new(config.auth.jwt_secret.clone(), config.auth.issuer.clone());

        let floor_state = FloorState::load(&db).await?;
        info!(
            tables = floor_state.tables.len(),
            sessions = floor_state.sessions.len(),
            tariffs = floor_state.tariffs.len(),
            "Floor loaded"
        );
        let floor_state = Arc::new(RwLock::new(floor_state));

        let backend = Arc::new(FloorBackend::new(floor_state.clone(), jwt.clone()));
        let hub = HubHandle::new(config.hub_config(), backend);

        let floor = Arc::new(Floor::new(db.clone(), hub.clone(), floor_state, config.action_timeout()));
        let guard = Arc::new(AccessGuard::new(&config));
        guard.spawn_sweeper(SWEEP_INTERVAL.min(config.pin_timeout()));

        Ok(Arc::new(AppState {
            tables: TableRegistry::new(floor.clone()),
            sessions: SessionManager::new(floor.clone(), config.venue_offset()),
            config,
            db,
            hub,
            floor,
            guard,
            jwt,
        }))
    }

    /// Runs a table action for `caller`.
    ///
    /// End, finalize and delete from a caller below manager are parked; the
    /// returned `Unauthorized` carries the pending id for the PIN flow.
    pub async fn perform(&self, caller: &Caller, action: TableAction) -> ApiResult<ActionResult> {
        self.floor.table(action.table_id()).await?;
        self.guard.admit(&action, caller.role, &caller.subject)?;
        self.execute(&action).await
    }

    /// Presents a manager PIN. `None` means the PIN was wrong and the action
    /// is still parked.
    pub async fn verify_pin(&self, caller: &Caller, pending_id: &str, pin: &str) -> ApiResult<Option<ActionResult>> {
        match self.guard.verify(&caller.subject, pending_id, pin).await? {
            Verification::Granted(pending) => {
                info!(
                    pending_id,
                    requested_by = %pending.requested_by,
                    verified_by = %caller.subject,
                    terminal_id = caller.terminal_id.as_deref().unwrap_or("-"),
                    "Running elevated action"
                );
                Ok(Some(self.execute(&pending.action).await?))
            }
            Verification::Denied => Ok(None),
        }
    }

    /// Runs an already authorized action.
    pub async fn execute(&self, action: &TableAction) -> ApiResult<ActionResult> {
        match action {
            TableAction::Start {
                table_id,
                tariff_id,
                player_count,
            } => self.sessions.start(table_id, tariff_id, *player_count).await,
            TableAction::Pause { table_id, reason } => self.sessions.pause(table_id, reason.clone()).await,
            TableAction::Resume { table_id } => self.sessions.resume(table_id).await,
            TableAction::End { table_id } => self.sessions.end(table_id).await,
            TableAction::Finalize { table_id } => self.sessions.finalize(table_id).await,
            TableAction::Clean { table_id } => self.tables.clean(table_id).await,
            TableAction::Delete { table_id } => self.tables.delete(table_id).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use cue_core::{CoreError, Role, TableStatus};

    use crate::testing::{self, MANAGER_PIN};

    fn staff_at(terminal: &str) -> Caller {
        Caller {
            subject: "staff-1".into(),
            role: Role::Staff,
            terminal_id: Some(terminal.into()),
        }
    }

    async fn parked_end(app: &AppState, table_id: &str) -> String {
        match app.perform(&staff_at("bar-1"), TableAction::End { table_id: table_id.into() }).await {
            Err(ApiError::Core(CoreError::Unauthorized {
                pending_id: Some(id), ..
            })) => id,
            other => panic!("Expected the end to be parked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rotating_terminal_id_does_not_reset_attempts() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();
        let pending_id = parked_end(&app, &table.id).await;

        for i in 0..app.config.access.max_attempts {
            let outcome = app
                .verify_pin(&staff_at(&format!("bar-{i}")), &pending_id, "0000")
                .await
                .unwrap();
            assert!(outcome.is_none());
        }

        let result = app
            .verify_pin(&staff_at("forged-terminal"), &pending_id, MANAGER_PIN)
            .await;
        assert!(matches!(
            result,
            Err(ApiError::Core(CoreError::TooManyAttempts { .. }))
        ));
        assert_eq!(
            app.tables.get(&table.id).await.unwrap().status,
            TableStatus::Occupied
        );
    }

    #[tokio::test]
    async fn test_subject_window_spans_pending_actions() {
        let (app, table, tariff) = testing::seeded().await;
        app.sessions.start(&table.id, &tariff.id, 2).await.unwrap();

        for i in 0..app.config.access.max_attempts {
            let pending_id = parked_end(&app, &table.id).await;
            let outcome = app
                .verify_pin(&staff_at(&format!("bar-{i}")), &pending_id, "0000")
                .await
                .unwrap();
            assert!(outcome.is_none());
            assert!(app.guard.cancel(&pending_id));
        }

        let pending_id = parked_end(&app, &table.id).await;
        assert!(matches!(
            app.verify_pin(&staff_at("bar-9"), &pending_id, MANAGER_PIN).await,
            Err(ApiError::Core(CoreError::TooManyAttempts { .. }))
        ));
    }
}
