//! Liveness check. Public: terminals poll it before they have a token.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub venue: String,
    pub database: bool,
    pub terminals: usize,
    pub pending_actions: usize,
    pub version: &'static str,
    pub server_time: DateTime<Utc>,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let database = state.db.health_check().await;
    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" },
        venue: state.config.venue.name.clone(),
        database,
        terminals: state.hub.client_count().await,
        pending_actions: state.guard.pending_count(),
        version: env!("CARGO_PKG_VERSION"),
        server_time: Utc::now(),
    })
}
