//! Feature flag persistence

use callwise_common::time::to_db_timestamp;
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use crate::models::FeatureFlag;

fn flag_from_row(row: &SqliteRow) -> Result<FeatureFlag> {
    let key: String = row.get("key");
    let plans: String = row.get("allowed_plans");
    let tenants: String = row.get("allowed_tenants");
    let rollout: i64 = row.get("rollout_percentage");

    let allowed_plans: Vec<String> = serde_json::from_str(&plans)
        .map_err(|e| Error::Internal(format!("Invalid allowed_plans for flag {}: {}", key, e)))?;
    let allowed_tenants: Vec<Uuid> = serde_json::from_str(&tenants)
        .map_err(|e| Error::Internal(format!("Invalid allowed_tenants for flag {}: {}", key, e)))?;

    Ok(FeatureFlag {
        enabled: row.get::<i64, _>("enabled") != 0,
        rollout_percentage: rollout.clamp(0, 100) as u8,
        allowed_plans,
        allowed_tenants,
        key,
    })
}

pub async fn load_flag(pool: &SqlitePool, key: &str) -> Result<Option<FeatureFlag>> {
    let row = sqlx::query(
        "SELECT key, enabled, rollout_percentage, allowed_plans, allowed_tenants FROM feature_flags WHERE key = ?",
    )
    .bind(key)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(flag_from_row).transpose()
}

pub async fn list_flags(pool: &SqlitePool) -> Result<Vec<FeatureFlag>> {
    let rows = sqlx::query(
        "SELECT key, enabled, rollout_percentage, allowed_plans, allowed_tenants FROM feature_flags ORDER BY key",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(flag_from_row).collect()
}

pub async fn upsert_flag(pool: &SqlitePool, flag: &FeatureFlag) -> Result<()> {
    if flag.rollout_percentage > 100 {
        return Err(Error::InvalidInput(format!(
            "rollout_percentage must be 0-100, got {}",
            flag.rollout_percentage
        )));
    }

    sqlx::query(
        r#"
        INSERT INTO feature_flags (key, enabled, rollout_percentage, allowed_plans, allowed_tenants, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            enabled = excluded.enabled,
            rollout_percentage = excluded.rollout_percentage,
            allowed_plans = excluded.allowed_plans,
            allowed_tenants = excluded.allowed_tenants,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&flag.key)
    .bind(flag.enabled as i64)
    .bind(flag.rollout_percentage as i64)
    .bind(serde_json::to_string(&flag.allowed_plans)?)
    .bind(serde_json::to_string(&flag.allowed_tenants)?)
    .bind(to_db_timestamp(Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}
