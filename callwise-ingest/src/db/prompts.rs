//! Prompt customization persistence

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_uuid};
use crate::models::{compute_signature, PromptCustomization, Stage};

const CUSTOMIZATION_COLUMNS: &str = r#"
    id, tenant_id, feature_slug, version, body, author, signature,
    restored_from, is_active, created_at, activated_at
"#;

fn customization_from_row(row: &SqliteRow) -> Result<PromptCustomization> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let feature: String = row.get("feature_slug");
    let created_at: String = row.get("created_at");

    Ok(PromptCustomization {
        id: parse_uuid("prompt_customizations.id", &id)?,
        tenant_id: parse_uuid("prompt_customizations.tenant_id", &tenant_id)?,
        feature: Stage::parse(&feature)
            .ok_or_else(|| Error::Internal(format!("Unknown feature slug: {}", feature)))?,
        version: row.get("version"),
        body: row.get("body"),
        author: row.get("author"),
        signature: row.get("signature"),
        restored_from: row.get("restored_from"),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_at: from_db_timestamp(&created_at)?,
        activated_at: parse_optional_timestamp(row.get("activated_at"))?,
    })
}

/// Global default prompt: (version, body)
pub async fn load_default(pool: &SqlitePool, feature: Stage) -> Result<Option<(i64, String)>> {
    let row = sqlx::query("SELECT version, body FROM default_prompts WHERE feature_slug = ?")
        .bind(feature.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|r| (r.get("version"), r.get("body"))))
}

pub async fn load_active(
    pool: &SqlitePool,
    tenant_id: Uuid,
    feature: Stage,
) -> Result<Option<PromptCustomization>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM prompt_customizations WHERE tenant_id = ? AND feature_slug = ? AND is_active = 1",
        CUSTOMIZATION_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(feature.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(customization_from_row).transpose()
}

pub async fn load_version(
    pool: &SqlitePool,
    tenant_id: Uuid,
    feature: Stage,
    version: i64,
) -> Result<Option<PromptCustomization>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM prompt_customizations WHERE tenant_id = ? AND feature_slug = ? AND version = ?",
        CUSTOMIZATION_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(feature.as_str())
    .bind(version)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(customization_from_row).transpose()
}

/// All versions, newest first
pub async fn history(
    pool: &SqlitePool,
    tenant_id: Uuid,
    feature: Stage,
) -> Result<Vec<PromptCustomization>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM prompt_customizations WHERE tenant_id = ? AND feature_slug = ? ORDER BY version DESC",
        CUSTOMIZATION_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(feature.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(customization_from_row).collect()
}

/// Append version max+1 and make it the only active one
///
/// Version allocation, deactivation of the previous version and the insert
/// share one transaction; the unique (tenant, feature, version) constraint
/// rejects a concurrent writer that picked the same number.
pub async fn insert_active_version(
    pool: &SqlitePool,
    tenant_id: Uuid,
    feature: Stage,
    body: &str,
    author: &str,
    restored_from: Option<i64>,
    now: DateTime<Utc>,
) -> Result<PromptCustomization> {
    let tenant = tenant_id.to_string();
    let timestamp = to_db_timestamp(now);
    let id = Uuid::new_v4();

    let mut tx = pool.begin().await?;

    let max_version: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(version) FROM prompt_customizations WHERE tenant_id = ? AND feature_slug = ?",
    )
    .bind(&tenant)
    .bind(feature.as_str())
    .fetch_one(&mut *tx)
    .await?;
    let version = max_version.unwrap_or(0) + 1;
    let signature = compute_signature(tenant_id, feature, version, body, author);

    sqlx::query(
        "UPDATE prompt_customizations SET is_active = 0 WHERE tenant_id = ? AND feature_slug = ? AND is_active = 1",
    )
    .bind(&tenant)
    .bind(feature.as_str())
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO prompt_customizations (
            id, tenant_id, feature_slug, version, body, author, signature,
            restored_from, is_active, created_at, activated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(&tenant)
    .bind(feature.as_str())
    .bind(version)
    .bind(body)
    .bind(author)
    .bind(&signature)
    .bind(restored_from)
    .bind(&timestamp)
    .bind(&timestamp)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(PromptCustomization {
        id,
        tenant_id,
        feature,
        version,
        body: body.to_string(),
        author: author.to_string(),
        signature,
        restored_from,
        is_active: true,
        created_at: now,
        activated_at: Some(now),
    })
}

/// Clear the active version; returns false when none was active
pub async fn deactivate(pool: &SqlitePool, tenant_id: Uuid, feature: Stage) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE prompt_customizations SET is_active = 0 WHERE tenant_id = ? AND feature_slug = ? AND is_active = 1",
    )
    .bind(tenant_id.to_string())
    .bind(feature.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
