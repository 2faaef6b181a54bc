//! Global feature flag administration
//!
//! Per-tenant overrides live under `/tenants/:tenant_id/features`.

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::FeatureFlag,
    AppState,
};

#[derive(Debug, Serialize)]
pub struct ListFlagsResponse {
    pub flags: Vec<FeatureFlag>,
}

#[derive(Debug, Deserialize)]
pub struct PutFlagRequest {
    pub enabled: bool,
    #[serde(default = "full_rollout")]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub allowed_plans: Vec<String>,
    #[serde(default)]
    pub allowed_tenants: Vec<Uuid>,
}

fn full_rollout() -> u8 {
    100
}

/// GET /flags
pub async fn list_flags(State(state): State<AppState>) -> ApiResult<Json<ListFlagsResponse>> {
    Ok(Json(ListFlagsResponse {
        flags: state.flags.list().await?,
    }))
}

/// PUT /flags/:key
pub async fn put_flag(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<PutFlagRequest>,
) -> ApiResult<Json<FeatureFlag>> {
    if key.trim().is_empty() {
        return Err(ApiError::BadRequest("flag key must not be empty".to_string()));
    }
    if request.rollout_percentage > 100 {
        return Err(ApiError::BadRequest(format!(
            "rollout_percentage {} outside 0-100",
            request.rollout_percentage
        )));
    }

    let flag = FeatureFlag {
        key: key.trim().to_string(),
        enabled: request.enabled,
        rollout_percentage: request.rollout_percentage,
        allowed_plans: request.allowed_plans,
        allowed_tenants: request.allowed_tenants,
    };
    state.flags.set_flag(&flag).await?;
    tracing::info!(key = %flag.key, enabled = flag.enabled, rollout = flag.rollout_percentage, "Feature flag updated");
    Ok(Json(flag))
}

pub fn flag_routes() -> Router<AppState> {
    Router::new()
        .route("/flags", get(list_flags))
        .route("/flags/:key", put(put_flag))
}
