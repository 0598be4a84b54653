//! What the hub reads from the floor: terminal tokens and snapshots.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::RwLock;

use cue_sync::protocol::HelloPayload;
use cue_sync::{HubBackend, SnapshotPayload, SyncError, SyncResult};

use crate::auth::JwtManager;
use crate::state::floor::FloorState;

/// [`HubBackend`] over the shared floor state.
pub struct FloorBackend {
    state: Arc<RwLock<FloorState>>,
    jwt: JwtManager,
}

impl FloorBackend {
    pub fn new(state: Arc<RwLock<FloorState>>, jwt: JwtManager) -> Self {
        FloorBackend { state, jwt }
    }
}

impl HubBackend for FloorBackend {
    fn authenticate(&self, hello: &HelloPayload) -> SyncResult<()> {
        let token = hello.token.as_deref().ok_or_else(|| SyncError::Rejected {
            code: "unauthorized".into(),
            message: "hello carries no token".into(),
        })?;

        self.jwt
            .validate_token(token)
            .map(|_| ())
            .map_err(|e| SyncError::Rejected {
                code: "unauthorized".into(),
                message: e.to_string(),
            })
    }

    fn snapshot(&self) -> BoxFuture<'_, SyncResult<SnapshotPayload>> {
        async move {
            let floor = self.state.read().await;
            Ok(SnapshotPayload {
                tables: floor.sorted_tables(),
                sessions: floor.sessions.values().cloned().collect(),
                active_layout: floor.active_layout.clone(),
                server_time: Utc::now(),
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cue_core::{Role, Table};

    fn hello(token: Option<String>) -> HelloPayload {
        HelloPayload {
            terminal_id: "bar-1".into(),
            token,
            protocol_version: cue_sync::protocol::PROTOCOL_VERSION,
            rooms: vec!["*".into()],
        }
    }

    #[test]
    fn test_hello_requires_valid_token() {
        let jwt = JwtManager::new("secret", None);
        let backend = FloorBackend::new(Arc::new(RwLock::new(FloorState::default())), jwt.clone());

        assert!(backend.authenticate(&hello(None)).is_err());
        assert!(backend.authenticate(&hello(Some("garbage".into()))).is_err());

        let token = jwt.issue("staff-1", Role::Staff, 60).unwrap();
        assert!(backend.authenticate(&hello(Some(token))).is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_floor() {
        let state = Arc::new(RwLock::new(FloorState::default()));
        let table = Table::new("Table 1", 4, "main", Utc::now()).unwrap();
        state.write().await.tables.insert(table.id.clone(), table.clone());
        state.write().await.active_layout = Some("evening".into());

        let backend = FloorBackend::new(state, JwtManager::new("secret", None));
        let snapshot = backend.snapshot().await.unwrap();

        assert_eq!(snapshot.tables, vec![table]);
        assert_eq!(snapshot.active_layout.as_deref(), Some("evening"));
    }
}
