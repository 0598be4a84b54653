//! Session reads, extra charges and discounts.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use cue_core::access::permissions;
use cue_core::{Discount, Money, SessionView};

use super::Body;
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/sessions/active", get(active))
        .route("/api/sessions/{id}", get(get_by_id))
        .route("/api/sessions/{id}/charges", post(add_charge))
        .route("/api/sessions/{id}/charges/{charge_id}", delete(remove_charge))
        .route("/api/sessions/{id}/discount", post(set_discount))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCharge {
    pub name: String,
    pub unit_price: Money,
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct DiscountUpdate {
    /// `null` clears the discount.
    pub discount: Option<Discount>,
}

/// GET /api/sessions/active
async fn active(State(state): State<Arc<AppState>>, caller: Caller) -> ApiResult<Json<Vec<SessionView>>> {
    caller.require(permissions::TABLES_READ)?;
    let now = Utc::now();
    let sessions = state.sessions.active_sessions().await;
    Ok(Json(sessions.iter().map(|s| SessionView::at(s, now)).collect()))
}

/// GET /api/sessions/{id}
async fn get_by_id(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    caller.require(permissions::TABLES_READ)?;
    let session = state.sessions.session(&id).await?;
    Ok(Json(SessionView::at(&session, Utc::now())))
}

/// POST /api/sessions/{id}/charges
async fn add_charge(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Body(payload): Body<NewCharge>,
) -> ApiResult<Json<SessionView>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    let session = state
        .sessions
        .add_charge(&id, &payload.name, payload.unit_price, payload.quantity)
        .await?;
    Ok(Json(SessionView::at(&session, Utc::now())))
}

/// DELETE /api/sessions/{id}/charges/{charge_id}
async fn remove_charge(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path((id, charge_id)): Path<(String, String)>,
) -> ApiResult<Json<SessionView>> {
    caller.require(permissions::SESSIONS_OPERATE)?;
    let session = state.sessions.remove_charge(&id, &charge_id).await?;
    Ok(Json(SessionView::at(&session, Utc::now())))
}

/// POST /api/sessions/{id}/discount
async fn set_discount(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Body(payload): Body<DiscountUpdate>,
) -> ApiResult<Json<SessionView>> {
    caller.require(permissions::SESSIONS_DISCOUNT)?;
    let session = state.sessions.set_discount(&id, payload.discount).await?;
    Ok(Json(SessionView::at(&session, Utc::now())))
}
