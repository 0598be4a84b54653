//! Manager PIN flow for parked actions.
//!
//! A wrong PIN is a normal outcome (`success: false`), not an error; the
//! action stays parked until it is verified, cancelled or expires.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::Body;
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::{ActionResult, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/pin/verify", post(verify))
        .route("/api/pin/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub pending_id: String,
    pub pin: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub pending_id: String,
}

/// POST /api/pin/verify
async fn verify(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Body(req): Body<VerifyRequest>,
) -> ApiResult<Json<VerifyResponse>> {
    let result = state.verify_pin(&caller, &req.pending_id, &req.pin).await?;
    Ok(Json(VerifyResponse {
        success: result.is_some(),
        result,
    }))
}

/// POST /api/pin/cancel
async fn cancel(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Body(req): Body<CancelRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancelled = state.guard.cancel(&req.pending_id);
    if cancelled {
        info!(pending_id = %req.pending_id, subject = %caller.subject, "Pending action cancelled");
    }
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}
