//! Recording fetch state persistence

use callwise_common::time::to_db_timestamp;
use callwise_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_uuid};
use crate::models::{Recording, RecordingState};

/// Create the `pending` row if none exists yet
pub async fn ensure_recording(pool: &SqlitePool, call_id: Uuid, tenant_id: Uuid) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO recordings (call_id, tenant_id, state, updated_at)
        VALUES (?, ?, 'pending', ?)
        "#,
    )
    .bind(call_id.to_string())
    .bind(tenant_id.to_string())
    .bind(to_db_timestamp(Utc::now()))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_recording(pool: &SqlitePool, call_id: Uuid) -> Result<Option<Recording>> {
    let row = sqlx::query(
        r#"
        SELECT call_id, tenant_id, state, file_path, size_bytes, content_type,
               attempts, last_error, fetched_at
        FROM recordings WHERE call_id = ?
        "#,
    )
    .bind(call_id.to_string())
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let call_id: String = row.get("call_id");
    let tenant_id: String = row.get("tenant_id");
    let state: String = row.get("state");

    Ok(Some(Recording {
        call_id: parse_uuid("recordings.call_id", &call_id)?,
        tenant_id: parse_uuid("recordings.tenant_id", &tenant_id)?,
        state: RecordingState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown recording state: {}", state)))?,
        file_path: row.get("file_path"),
        size_bytes: row.get("size_bytes"),
        content_type: row.get("content_type"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        fetched_at: parse_optional_timestamp(row.get("fetched_at"))?,
    }))
}

pub async fn mark_fetched(
    pool: &SqlitePool,
    call_id: Uuid,
    file_path: &str,
    size_bytes: i64,
    content_type: Option<&str>,
    attempts: u32,
    fetched_at: DateTime<Utc>,
) -> Result<()> {
    let now = to_db_timestamp(fetched_at);
    sqlx::query(
        r#"
        UPDATE recordings SET
            state = 'fetched', file_path = ?, size_bytes = ?, content_type = ?,
            attempts = attempts + ?, last_error = NULL, fetched_at = ?, updated_at = ?
        WHERE call_id = ?
        "#,
    )
    .bind(file_path)
    .bind(size_bytes)
    .bind(content_type)
    .bind(attempts as i64)
    .bind(&now)
    .bind(&now)
    .bind(call_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Record a terminal `failed` or `unavailable` outcome
pub async fn mark_terminal_failure(
    pool: &SqlitePool,
    call_id: Uuid,
    state: RecordingState,
    attempts: u32,
    error: &str,
) -> Result<()> {
    debug_assert!(matches!(
        state,
        RecordingState::Failed | RecordingState::Unavailable
    ));

    sqlx::query(
        r#"
        UPDATE recordings SET state = ?, attempts = attempts + ?, last_error = ?, updated_at = ?
        WHERE call_id = ? AND state != 'fetched'
        "#,
    )
    .bind(state.as_str())
    .bind(attempts as i64)
    .bind(error)
    .bind(to_db_timestamp(Utc::now()))
    .bind(call_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Put a `failed` recording back to `pending` so the next retrieval refetches it.
/// `unavailable` stays terminal; the PBX has said the file does not exist.
pub async fn reset_failed(pool: &SqlitePool, call_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE recordings SET state = 'pending', last_error = NULL, updated_at = ?
        WHERE call_id = ? AND state = 'failed'
        "#,
    )
    .bind(to_db_timestamp(Utc::now()))
    .bind(call_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
