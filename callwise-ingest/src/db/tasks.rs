//! Enrichment task queue persistence
//!
//! **Invariant:** at most one `pipeline` task per call ever, at most one open
//! task per (call, kind). Both are enforced by a partial unique index, so
//! `enqueue` is `INSERT OR IGNORE`.

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use super::parse_uuid;
use crate::models::{EnrichmentTask, TaskKind, TaskState};

const TASK_COLUMNS: &str =
    "id, call_id, tenant_id, kind, state, attempts, last_error, created_at, updated_at";

fn task_from_row(row: &SqliteRow) -> Result<EnrichmentTask> {
    let call_id: String = row.get("call_id");
    let tenant_id: String = row.get("tenant_id");
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(EnrichmentTask {
        id: row.get("id"),
        call_id: parse_uuid("enrichment_tasks.call_id", &call_id)?,
        tenant_id: parse_uuid("enrichment_tasks.tenant_id", &tenant_id)?,
        kind: TaskKind::from_db(&kind)
            .ok_or_else(|| Error::Internal(format!("Unknown task kind: {}", kind)))?,
        state: TaskState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown task state: {}", state)))?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        created_at: from_db_timestamp(&created_at)?,
        updated_at: from_db_timestamp(&updated_at)?,
    })
}

/// Returns true when a new task row was created
pub async fn enqueue(
    pool: &SqlitePool,
    call_id: Uuid,
    tenant_id: Uuid,
    kind: TaskKind,
) -> Result<bool> {
    let now = to_db_timestamp(Utc::now());
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO enrichment_tasks (call_id, tenant_id, kind, state, created_at, updated_at)
        VALUES (?, ?, ?, 'pending', ?, ?)
        "#,
    )
    .bind(call_id.to_string())
    .bind(tenant_id.to_string())
    .bind(kind.to_db())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Claim up to `limit` pending tasks of active tenants, oldest first
///
/// Each claim is a conditional `pending → running` update, so two
/// dispatchers never run the same task.
pub async fn claim_pending(pool: &SqlitePool, limit: i64) -> Result<Vec<EnrichmentTask>> {
    let candidates: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT t.id FROM enrichment_tasks t
        JOIN tenants ten ON ten.id = t.tenant_id
        WHERE t.state = 'pending' AND ten.status = 'active'
          AND (t.available_at IS NULL OR t.available_at <= ?)
        ORDER BY t.id
        LIMIT ?
        "#,
    )
    .bind(Utc::now().timestamp_millis())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut claimed = Vec::with_capacity(candidates.len());
    for id in candidates {
        let row = sqlx::query(&format!(
            "UPDATE enrichment_tasks SET state = 'running', attempts = attempts + 1, updated_at = ? \
             WHERE id = ? AND state = 'pending' RETURNING {}",
            TASK_COLUMNS
        ))
        .bind(to_db_timestamp(Utc::now()))
        .bind(id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            claimed.push(task_from_row(&row)?);
        }
    }

    Ok(claimed)
}

pub async fn mark_done(pool: &SqlitePool, task_id: i64) -> Result<()> {
    sqlx::query("UPDATE enrichment_tasks SET state = 'done', updated_at = ? WHERE id = ?")
        .bind(to_db_timestamp(Utc::now()))
        .bind(task_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Put a claimed task back (deferral or failure before completion)
///
/// With `retry_after` set the task is not claimable until that much time has
/// passed.
pub async fn return_to_pending(
    pool: &SqlitePool,
    task_id: i64,
    error: Option<&str>,
    retry_after: Option<Duration>,
) -> Result<()> {
    let available_at = retry_after.map(|delay| {
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(millis)
    });
    sqlx::query(
        "UPDATE enrichment_tasks SET state = 'pending', last_error = ?, available_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(error)
    .bind(available_at)
    .bind(to_db_timestamp(Utc::now()))
    .bind(task_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Startup recovery: every `running` task goes back to `pending`
pub async fn recover_running(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE enrichment_tasks SET state = 'pending', available_at = NULL, updated_at = ? WHERE state = 'running'",
    )
    .bind(to_db_timestamp(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn tasks_for_call(pool: &SqlitePool, call_id: Uuid) -> Result<Vec<EnrichmentTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM enrichment_tasks WHERE call_id = ? ORDER BY id",
        TASK_COLUMNS
    ))
    .bind(call_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(task_from_row).collect()
}

pub async fn count_pending(pool: &SqlitePool) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM enrichment_tasks WHERE state = 'pending'")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
