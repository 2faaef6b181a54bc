//! Usage counter persistence
//!
//! One row per (tenant, `YYYY-MM` period). A new period starts from a fresh
//! row, which is the monthly reset.

use callwise_common::time::to_db_timestamp;
use callwise_common::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::UsageCounterKind;

/// Raw counter values for one period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValues {
    pub calls_processed: i64,
    pub transcription_minutes: i64,
    pub storage_bytes: i64,
    pub api_calls: i64,
}

impl CounterValues {
    pub fn get(&self, counter: UsageCounterKind) -> i64 {
        match counter {
            UsageCounterKind::CallsProcessed => self.calls_processed,
            UsageCounterKind::TranscriptionMinutes => self.transcription_minutes,
            UsageCounterKind::StorageBytes => self.storage_bytes,
            UsageCounterKind::ApiCalls => self.api_calls,
        }
    }
}

async fn ensure_row(pool: &SqlitePool, tenant_id: &str, period: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO usage_counters (tenant_id, period) VALUES (?, ?)")
        .bind(tenant_id)
        .bind(period)
        .execute(pool)
        .await?;
    Ok(())
}

/// Atomically add `amount` unless that would exceed `limit`
///
/// Returns true when the increment was applied. `limit = None` always applies.
pub async fn try_increment(
    pool: &SqlitePool,
    tenant_id: Uuid,
    period: &str,
    counter: UsageCounterKind,
    amount: i64,
    limit: Option<i64>,
) -> Result<bool> {
    let tenant = tenant_id.to_string();
    ensure_row(pool, &tenant, period).await?;

    let column = counter.column();
    let now = to_db_timestamp(Utc::now());

    let result = match limit {
        Some(limit) => {
            sqlx::query(&format!(
                "UPDATE usage_counters SET {col} = {col} + ?1, updated_at = ?2 \
                 WHERE tenant_id = ?3 AND period = ?4 AND {col} + ?1 <= ?5",
                col = column
            ))
            .bind(amount)
            .bind(&now)
            .bind(&tenant)
            .bind(period)
            .bind(limit)
            .execute(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "UPDATE usage_counters SET {col} = {col} + ?1, updated_at = ?2 \
                 WHERE tenant_id = ?3 AND period = ?4",
                col = column
            ))
            .bind(amount)
            .bind(&now)
            .bind(&tenant)
            .bind(period)
            .execute(pool)
            .await?
        }
    };

    Ok(result.rows_affected() == 1)
}

/// Subtract `amount`, never going below zero
pub async fn decrement(
    pool: &SqlitePool,
    tenant_id: Uuid,
    period: &str,
    counter: UsageCounterKind,
    amount: i64,
) -> Result<()> {
    let column = counter.column();
    sqlx::query(&format!(
        "UPDATE usage_counters SET {col} = MAX({col} - ?1, 0), updated_at = ?2 \
         WHERE tenant_id = ?3 AND period = ?4",
        col = column
    ))
    .bind(amount)
    .bind(to_db_timestamp(Utc::now()))
    .bind(tenant_id.to_string())
    .bind(period)
    .execute(pool)
    .await?;

    Ok(())
}

/// Counter values for one period (zeros when no row exists)
pub async fn load_counters(pool: &SqlitePool, tenant_id: Uuid, period: &str) -> Result<CounterValues> {
    let row = sqlx::query(
        r#"
        SELECT calls_processed, transcription_minutes, storage_bytes, api_calls
        FROM usage_counters WHERE tenant_id = ? AND period = ?
        "#,
    )
    .bind(tenant_id.to_string())
    .bind(period)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|r| CounterValues {
            calls_processed: r.get("calls_processed"),
            transcription_minutes: r.get("transcription_minutes"),
            storage_bytes: r.get("storage_bytes"),
            api_calls: r.get("api_calls"),
        })
        .unwrap_or_default())
}
