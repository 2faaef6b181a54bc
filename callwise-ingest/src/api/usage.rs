//! GET /tenants/:tenant_id/usage

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::UsageSnapshot,
    AppState,
};

/// Current billing period usage and plan limits
pub async fn get_usage(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<UsageSnapshot>> {
    let tenant = state
        .tenants
        .get(tenant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Tenant {}", tenant_id)))?;

    Ok(Json(state.quota.usage(&tenant, Utc::now()).await?))
}

pub fn usage_routes() -> Router<AppState> {
    Router::new().route("/tenants/:tenant_id/usage", get(get_usage))
}
