//! Prompt customization API
//!
//! Feature slugs: transcription, sentiment, quality, compliance, summary

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::calls::parse_stage;
use crate::{
    error::{ApiError, ApiResult},
    models::{PromptCustomization, PromptSource, Stage},
    AppState,
};

#[derive(Debug, Serialize)]
pub struct PromptOverviewResponse {
    pub tenant_id: Uuid,
    pub feature: Stage,
    pub active: Option<PromptCustomization>,
    /// Newest first
    pub history: Vec<PromptCustomization>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePromptRequest {
    pub body: String,
    pub author: String,
}

#[derive(Debug, Deserialize)]
pub struct RestorePromptRequest {
    pub author: String,
}

#[derive(Debug, Serialize)]
pub struct DeactivateResponse {
    pub tenant_id: Uuid,
    pub feature: Stage,
    pub deactivated: bool,
}

#[derive(Debug, Serialize)]
pub struct ResolvedPromptResponse {
    pub tenant_id: Uuid,
    pub feature: Stage,
    pub source: PromptSource,
    pub customization_id: Option<Uuid>,
    pub version: i64,
    pub identity: String,
    pub body: String,
}

async fn ensure_tenant(state: &AppState, tenant_id: Uuid) -> ApiResult<()> {
    match state.tenants.get(tenant_id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::NotFound(format!("Tenant {}", tenant_id))),
    }
}

/// GET /tenants/:tenant_id/prompts/:feature
pub async fn get_prompts(
    State(state): State<AppState>,
    Path((tenant_id, feature)): Path<(Uuid, String)>,
) -> ApiResult<Json<PromptOverviewResponse>> {
    let feature = parse_stage(&feature)?;
    ensure_tenant(&state, tenant_id).await?;

    let history = state.prompts.history(tenant_id, feature).await?;
    let active = history.iter().find(|p| p.is_active).cloned();

    Ok(Json(PromptOverviewResponse {
        tenant_id,
        feature,
        active,
        history,
    }))
}

/// POST /tenants/:tenant_id/prompts/:feature
pub async fn create_prompt(
    State(state): State<AppState>,
    Path((tenant_id, feature)): Path<(Uuid, String)>,
    Json(request): Json<CreatePromptRequest>,
) -> ApiResult<(StatusCode, Json<PromptCustomization>)> {
    let feature = parse_stage(&feature)?;
    ensure_tenant(&state, tenant_id).await?;

    let created = state
        .prompts
        .create(tenant_id, feature, &request.body, &request.author)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /tenants/:tenant_id/prompts/:feature/versions/:version/restore
pub async fn restore_prompt(
    State(state): State<AppState>,
    Path((tenant_id, feature, version)): Path<(Uuid, String, i64)>,
    Json(request): Json<RestorePromptRequest>,
) -> ApiResult<(StatusCode, Json<PromptCustomization>)> {
    let feature = parse_stage(&feature)?;
    ensure_tenant(&state, tenant_id).await?;

    let restored = state
        .prompts
        .restore(tenant_id, feature, version, &request.author)
        .await?;
    Ok((StatusCode::CREATED, Json(restored)))
}

/// DELETE /tenants/:tenant_id/prompts/:feature/active
pub async fn deactivate_prompt(
    State(state): State<AppState>,
    Path((tenant_id, feature)): Path<(Uuid, String)>,
) -> ApiResult<Json<DeactivateResponse>> {
    let feature = parse_stage(&feature)?;
    ensure_tenant(&state, tenant_id).await?;

    let deactivated = state.prompts.deactivate(tenant_id, feature).await?;
    Ok(Json(DeactivateResponse {
        tenant_id,
        feature,
        deactivated,
    }))
}

/// GET /tenants/:tenant_id/prompts/:feature/resolved
///
/// The prompt a stage started now would use.
pub async fn resolved_prompt(
    State(state): State<AppState>,
    Path((tenant_id, feature)): Path<(Uuid, String)>,
) -> ApiResult<Json<ResolvedPromptResponse>> {
    let feature = parse_stage(&feature)?;
    ensure_tenant(&state, tenant_id).await?;

    let resolved = state.prompts.resolve(tenant_id, feature).await?;
    Ok(Json(ResolvedPromptResponse {
        tenant_id,
        feature,
        source: resolved.source,
        customization_id: resolved.customization_id,
        version: resolved.version,
        identity: resolved.identity(),
        body: resolved.body,
    }))
}

pub fn prompt_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/tenants/:tenant_id/prompts/:feature",
            get(get_prompts).post(create_prompt),
        )
        .route(
            "/tenants/:tenant_id/prompts/:feature/versions/:version/restore",
            post(restore_prompt),
        )
        .route("/tenants/:tenant_id/prompts/:feature/active", delete(deactivate_prompt))
        .route("/tenants/:tenant_id/prompts/:feature/resolved", get(resolved_prompt))
}
