//! Table registry, table actions and floor-plan layouts.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

use cue_core::access::permissions;
use cue_core::{SessionView, Table, TableAction};

use super::{action_id, Body};
use crate::auth::Caller;
use crate::error::{ApiError, ApiResult};
use crate::{ActionResult, AppState};

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tables", get(list).post(create))
        .route("/api/tables/{id}", get(get_by_id).put(update).delete(delete))
        .route("/api/tables/{id}/maintenance", post(maintenance))
        .route("/api/tables/{id}/start", post(start))
        .route("/api/tables/{id}/pause", post(pause))
        .route("/api/tables/{id}/resume", post(resume))
        .route("/api/tables/{id}/end", post(end))
        .route("/api/tables/{id}/finalize", post(finalize))
        .route("/api/tables/{id}/clean", post(clean))
        .route("/api/tables/{id}/session", get(session))
        .route("/api/tables/{id}/history", get(history))
        .route("/api/layouts/{id}/activate", post(activate_layout))
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTable {
    pub name: String,
    pub capacity: u32,
    #[serde(default = "default_room")]
    pub room: String,
}

fn default_room() -> String {
    "main".into()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTable {
    pub name: Option<String>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceToggle {
    pub on: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub tariff_id: String,
    pub player_count: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct PauseSession {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

// =============================================================================
// Registry
// =============================================================================

/// GET /api/tables
async fn list(State(state): State<Arc<AppState>>, caller: Caller) -> ApiResult<Json<Vec<Table>>> {
    caller.require(permissions::TABLES_READ)?;
    Ok(Json(state.tables.list().await))
}

/// GET /api/tables/{id}
async fn get_by_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Table>> {
    caller.require(permissions::TABLES_READ)?;
    Ok(Json(state.tables.get(&id).await?))
}

/// POST /api/tables
async fn create(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Body(payload): Body<CreateTable>,
) -> ApiResult<Json<Table>> {
    caller.require_manager()?;
    let table = state
        .tables
        .create(&payload.name, payload.capacity, &payload.room)
        .await?;
    Ok(Json(table))
}

/// PUT /api/tables/{id}
async fn update(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Body(payload): Body<UpdateTable>,
) -> ApiResult<Json<Table>> {
    caller.require_manager()?;
    let table = state
        .tables
        .update(&id, payload.name.as_deref(), payload.capacity)
        .await?;
    Ok(Json(table))
}

/// DELETE /api/tables/{id} - soft delete, elevated below manager
async fn delete(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResult>> {
    run(&state, &caller, &headers, TableAction::Delete { table_id: id }).await
}

/// POST /api/tables/{id}/maintenance
async fn maintenance(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Body(payload): Body<MaintenanceToggle>,
) -> ApiResult<Json<Table>> {
    caller.require_manager()?;
    Ok(Json(state.tables.set_maintenance(&id, payload.on).await?))
}

// =============================================================================
// Table Actions
// =============================================================================

/// POST /api/tables/{id}/start
async fn start(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
    Body(payload): Body<StartSession>,
) -> ApiResult<Json<ActionResult>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    let action = TableAction::Start {
        table_id: id,
        tariff_id: payload.tariff_id,
        player_count: payload.player_count,
    };
    run(&state, &caller, &headers, action).await
}

/// POST /api/tables/{id}/pause
async fn pause(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ActionResult>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    // The body is optional; an empty one means no reason.
    let reason = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<PauseSession>(&body)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
            .reason
    };
    run(&state, &caller, &headers, TableAction::Pause { table_id: id, reason }).await
}

/// POST /api/tables/{id}/resume
async fn resume(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResult>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    run(&state, &caller, &headers, TableAction::Resume { table_id: id }).await
}

/// POST /api/tables/{id}/end
async fn end(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResult>> {
    run(&state, &caller, &headers, TableAction::End { table_id: id }).await
}

/// POST /api/tables/{id}/finalize
async fn finalize(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResult>> {
    run(&state, &caller, &headers, TableAction::Finalize { table_id: id }).await
}

/// POST /api/tables/{id}/clean
async fn clean(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ActionResult>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    run(&state, &caller, &headers, TableAction::Clean { table_id: id }).await
}

async fn run(
    state: &AppState,
    caller: &Caller,
    headers: &HeaderMap,
    action: TableAction,
) -> ApiResult<Json<ActionResult>> {
    debug!(
        action_id = action_id(headers),
        kind = %action.kind(),
        table_id = action.table_id(),
        subject = %caller.subject,
        "Table action"
    );
    Ok(Json(state.perform(caller, action).await?))
}

// =============================================================================
// Reads
// =============================================================================

/// GET /api/tables/{id}/session - held session, or the latest one
async fn session(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<SessionView>>> {
    caller.require(permissions::TABLES_READ)?;
    state.tables.get(&id).await?;
    let session = state.sessions.session_for_table(&id).await?;
    Ok(Json(session.map(|s| SessionView::at(&s, chrono::Utc::now()))))
}

/// GET /api/tables/{id}/history?limit=N
async fn history(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Vec<SessionView>>> {
    caller.require(permissions::TABLES_READ)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let now = chrono::Utc::now();
    let sessions = state.sessions.history(&id, limit).await?;
    Ok(Json(sessions.iter().map(|s| SessionView::at(s, now)).collect()))
}

// =============================================================================
// Layouts
// =============================================================================

/// POST /api/layouts/{id}/activate
async fn activate_layout(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    caller.require(permissions::LAYOUTS_ACTIVATE)?;
    state.tables.activate_layout(&id).await;
    Ok(Json(serde_json::json!({ "layoutId": id })))
}
