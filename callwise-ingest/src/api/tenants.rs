//! Tenant administration API
//!
//! Secrets are never returned except once, in the provisioning response.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    models::{NewTenant, PbxProfile, PbxSystem, Tenant, TenantStatus},
    AppState,
};

/// Tenant without credentials
#[derive(Debug, Serialize)]
pub struct TenantView {
    pub id: Uuid,
    pub routing_key: String,
    pub display_name: String,
    pub webhook_username: String,
    pub pbx_system: PbxSystem,
    pub pbx_base_url: String,
    pub plan_id: String,
    pub feature_overrides: HashMap<String, bool>,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Tenant> for TenantView {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id,
            routing_key: tenant.routing_key.clone(),
            display_name: tenant.display_name.clone(),
            webhook_username: tenant.webhook_username.clone(),
            pbx_system: tenant.pbx.system,
            pbx_base_url: tenant.pbx.base_url.clone(),
            plan_id: tenant.plan_id.clone(),
            feature_overrides: tenant.feature_overrides.clone(),
            status: tenant.status,
            created_at: tenant.created_at,
            updated_at: tenant.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProvisionTenantRequest {
    pub routing_key: String,
    pub display_name: String,
    pub webhook_username: String,
    pub webhook_secret: Option<String>,
    pub pbx_system: PbxSystem,
    #[serde(default)]
    pub pbx_base_url: String,
    #[serde(default)]
    pub pbx_username: String,
    #[serde(default)]
    pub pbx_secret: String,
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
pub struct ProvisionTenantResponse {
    pub tenant: TenantView,
    pub webhook_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct FeatureOverrideRequest {
    pub key: String,
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct ListTenantsResponse {
    pub tenants: Vec<TenantView>,
}

/// GET /tenants
pub async fn list_tenants(State(state): State<AppState>) -> ApiResult<Json<ListTenantsResponse>> {
    let tenants = state.tenants.list().await?;
    Ok(Json(ListTenantsResponse {
        tenants: tenants.iter().map(TenantView::from).collect(),
    }))
}

/// POST /tenants
pub async fn provision_tenant(
    State(state): State<AppState>,
    Json(request): Json<ProvisionTenantRequest>,
) -> ApiResult<(StatusCode, Json<ProvisionTenantResponse>)> {
    if request.webhook_username.trim().is_empty() {
        return Err(ApiError::BadRequest("webhook_username must not be empty".to_string()));
    }

    let tenant = state
        .tenants
        .provision(NewTenant {
            routing_key: request.routing_key,
            display_name: request.display_name,
            webhook_username: request.webhook_username,
            webhook_secret: request.webhook_secret,
            pbx: PbxProfile {
                system: request.pbx_system,
                base_url: request.pbx_base_url,
                username: request.pbx_username,
                secret: request.pbx_secret,
            },
            plan_id: request.plan_id,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ProvisionTenantResponse {
            tenant: TenantView::from(&tenant),
            webhook_secret: tenant.webhook_secret.clone(),
        }),
    ))
}

/// POST /tenants/:tenant_id/suspend
///
/// Webhooks are rejected and queued work is deferred; stages already
/// running finish.
pub async fn suspend_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantView>> {
    let tenant = state.tenants.suspend(tenant_id).await?;
    Ok(Json(TenantView::from(&tenant)))
}

/// POST /tenants/:tenant_id/activate
pub async fn activate_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<TenantView>> {
    let tenant = state.tenants.activate(tenant_id).await?;
    // Deferred tasks of this tenant become claimable again
    state.queue.wake();
    Ok(Json(TenantView::from(&tenant)))
}

/// POST /tenants/:tenant_id/rotate-secret
///
/// The new secret is returned once; the old one stops working immediately.
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ProvisionTenantResponse>> {
    let tenant = state.tenants.rotate_webhook_secret(tenant_id).await?;
    tracing::info!(tenant_id = %tenant_id, "Webhook secret rotated");
    Ok(Json(ProvisionTenantResponse {
        tenant: TenantView::from(&tenant),
        webhook_secret: tenant.webhook_secret.clone(),
    }))
}

/// POST /tenants/:tenant_id/features
pub async fn set_feature_override(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<FeatureOverrideRequest>,
) -> ApiResult<Json<TenantView>> {
    if request.key.trim().is_empty() {
        return Err(ApiError::BadRequest("flag key must not be empty".to_string()));
    }
    let tenant = state
        .tenants
        .set_feature_override(tenant_id, request.key.trim(), request.enabled)
        .await?;
    Ok(Json(TenantView::from(&tenant)))
}

pub fn tenant_routes() -> Router<AppState> {
    Router::new()
        .route("/tenants", get(list_tenants).post(provision_tenant))
        .route("/tenants/:tenant_id/suspend", post(suspend_tenant))
        .route("/tenants/:tenant_id/activate", post(activate_tenant))
        .route("/tenants/:tenant_id/rotate-secret", post(rotate_secret))
        .route("/tenants/:tenant_id/features", post(set_feature_override))
}
