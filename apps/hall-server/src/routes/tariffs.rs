//! Tariff definitions.
//!
//! Edits never reach running sessions: a session keeps the tariff copy it
//! was started with.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use cue_core::access::permissions;
use cue_core::tariff::validate_tariff;
use cue_core::{CoreError, Money, RateType, Tariff, TariffRestrictions, TieredRate};

use super::Body;
use crate::auth::Caller;
use crate::error::ApiResult;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tariffs", get(list).post(create))
        .route("/api/tariffs/{id}", put(update))
}

/// Tariff fields a manager may set.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TariffInput {
    pub name: String,
    pub rate: Money,
    pub rate_type: RateType,
    #[serde(default)]
    pub free_minutes: u32,
    #[serde(default)]
    pub min_duration_minutes: Option<u32>,
    #[serde(default)]
    pub max_duration_minutes: Option<u32>,
    #[serde(default)]
    pub restrictions: TariffRestrictions,
    #[serde(default)]
    pub tiered_rates: Vec<TieredRate>,
    #[serde(default = "active")]
    pub is_active: bool,
}

fn active() -> bool {
    true
}

impl TariffInput {
    fn into_tariff(self, id: String, created_at: chrono::DateTime<Utc>) -> Tariff {
        Tariff {
            id,
            name: self.name,
            rate: self.rate,
            rate_type: self.rate_type,
            free_minutes: self.free_minutes,
            min_duration_minutes: self.min_duration_minutes,
            max_duration_minutes: self.max_duration_minutes,
            restrictions: self.restrictions,
            tiered_rates: self.tiered_rates,
            is_active: self.is_active,
            created_at,
            updated_at: Utc::now(),
        }
    }
}

/// GET /api/tariffs
async fn list(State(state): State<Arc<AppState>>, caller: Caller) -> ApiResult<Json<Vec<Tariff>>> {
    caller.require(permissions::TABLES_READ)?;
    let mut tariffs: Vec<Tariff> = state.floor.read().await.tariffs.values().cloned().collect();
    tariffs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(tariffs))
}

/// POST /api/tariffs
async fn create(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Body(input): Body<TariffInput>,
) -> ApiResult<Json<Tariff>> {
    caller.require(permissions::TARIFFS_MANAGE)?;
    let tariff = input.into_tariff(Uuid::new_v4().to_string(), Utc::now());
    validate_tariff(&tariff)?;
    Ok(Json(state.floor.save_tariff(tariff).await?))
}

/// PUT /api/tariffs/{id}
async fn update(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(id): Path<String>,
    Body(input): Body<TariffInput>,
) -> ApiResult<Json<Tariff>> {
    caller.require(permissions::TARIFFS_MANAGE)?;
    let created_at = state
        .floor
        .read()
        .await
        .tariffs
        .get(&id)
        .map(|t| t.created_at)
        .ok_or_else(|| CoreError::not_found("tariff", &id))?;

    let tariff = input.into_tariff(id, created_at);
    validate_tariff(&tariff)?;
    Ok(Json(state.floor.save_tariff(tariff).await?))
}
