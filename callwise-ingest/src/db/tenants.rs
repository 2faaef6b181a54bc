//! Tenant persistence

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::collections::HashMap;
use uuid::Uuid;

use super::parse_uuid;
use crate::models::{PbxProfile, PbxSystem, Tenant, TenantStatus};

const TENANT_COLUMNS: &str = r#"
    id, routing_key, display_name, webhook_username, webhook_secret,
    pbx_system, pbx_base_url, pbx_username, pbx_secret, plan_id,
    feature_overrides, status, created_at, updated_at
"#;

fn tenant_from_row(row: &SqliteRow) -> Result<Tenant> {
    let id: String = row.get("id");
    let pbx_system: String = row.get("pbx_system");
    let status: String = row.get("status");
    let overrides: String = row.get("feature_overrides");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let feature_overrides: HashMap<String, bool> = serde_json::from_str(&overrides)
        .map_err(|e| Error::Internal(format!("Invalid feature_overrides for tenant {}: {}", id, e)))?;

    Ok(Tenant {
        id: parse_uuid("tenants.id", &id)?,
        routing_key: row.get("routing_key"),
        display_name: row.get("display_name"),
        webhook_username: row.get("webhook_username"),
        webhook_secret: row.get("webhook_secret"),
        pbx: PbxProfile {
            system: PbxSystem::parse(&pbx_system)
                .ok_or_else(|| Error::Internal(format!("Unknown pbx_system: {}", pbx_system)))?,
            base_url: row.get("pbx_base_url"),
            username: row.get("pbx_username"),
            secret: row.get("pbx_secret"),
        },
        plan_id: row.get("plan_id"),
        feature_overrides,
        status: TenantStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("Unknown tenant status: {}", status)))?,
        created_at: from_db_timestamp(&created_at)?,
        updated_at: from_db_timestamp(&updated_at)?,
    })
}

/// Insert a fully-populated tenant
pub async fn insert_tenant(pool: &SqlitePool, tenant: &Tenant) -> Result<()> {
    let overrides = serde_json::to_string(&tenant.feature_overrides)?;

    sqlx::query(
        r#"
        INSERT INTO tenants (
            id, routing_key, display_name, webhook_username, webhook_secret,
            pbx_system, pbx_base_url, pbx_username, pbx_secret, plan_id,
            feature_overrides, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tenant.id.to_string())
    .bind(&tenant.routing_key)
    .bind(&tenant.display_name)
    .bind(&tenant.webhook_username)
    .bind(&tenant.webhook_secret)
    .bind(tenant.pbx.system.as_str())
    .bind(&tenant.pbx.base_url)
    .bind(&tenant.pbx.username)
    .bind(&tenant.pbx.secret)
    .bind(&tenant.plan_id)
    .bind(overrides)
    .bind(tenant.status.as_str())
    .bind(to_db_timestamp(tenant.created_at))
    .bind(to_db_timestamp(tenant.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_tenant(pool: &SqlitePool, tenant_id: Uuid) -> Result<Option<Tenant>> {
    let row = sqlx::query(&format!("SELECT {} FROM tenants WHERE id = ?", TENANT_COLUMNS))
        .bind(tenant_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(tenant_from_row).transpose()
}

pub async fn load_by_routing_key(pool: &SqlitePool, routing_key: &str) -> Result<Option<Tenant>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM tenants WHERE routing_key = ?",
        TENANT_COLUMNS
    ))
    .bind(routing_key)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(tenant_from_row).transpose()
}

pub async fn list_tenants(pool: &SqlitePool) -> Result<Vec<Tenant>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM tenants ORDER BY routing_key",
        TENANT_COLUMNS
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(tenant_from_row).collect()
}

/// Returns false when the tenant does not exist
pub async fn set_status(pool: &SqlitePool, tenant_id: Uuid, status: TenantStatus) -> Result<bool> {
    let result = sqlx::query("UPDATE tenants SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(to_db_timestamp(Utc::now()))
        .bind(tenant_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn update_webhook_credentials(
    pool: &SqlitePool,
    tenant_id: Uuid,
    username: &str,
    secret: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE tenants SET webhook_username = ?, webhook_secret = ?, updated_at = ? WHERE id = ?",
    )
    .bind(username)
    .bind(secret)
    .bind(to_db_timestamp(Utc::now()))
    .bind(tenant_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_feature_override(
    pool: &SqlitePool,
    tenant_id: Uuid,
    overrides: &HashMap<String, bool>,
) -> Result<bool> {
    let result = sqlx::query("UPDATE tenants SET feature_overrides = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(overrides)?)
        .bind(to_db_timestamp(Utc::now()))
        .bind(tenant_id.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}
