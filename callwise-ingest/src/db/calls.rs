//! Call record persistence and the idempotent CDR upsert

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_uuid};
use crate::models::{CallRecord, Disposition, NormalizedCdr, PbxSystem, UpsertOutcome};
use crate::utils::retry_on_lock;

const CALL_COLUMNS: &str = r#"
    id, tenant_id, uniqueid, source_number, destination_number, started_at,
    duration_seconds, disposition, recording_ref, pbx_system, raw_payload,
    finalized_at, usage_charged, minutes_charged, created_at, updated_at
"#;

fn call_from_row(row: &SqliteRow) -> Result<CallRecord> {
    let id: String = row.get("id");
    let tenant_id: String = row.get("tenant_id");
    let disposition: Option<String> = row.get("disposition");
    let pbx_system: String = row.get("pbx_system");
    let raw_payload: String = row.get("raw_payload");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let disposition = match disposition {
        Some(value) => Some(
            Disposition::from_db(&value)
                .ok_or_else(|| Error::Internal(format!("Unknown disposition: {}", value)))?,
        ),
        None => None,
    };

    Ok(CallRecord {
        id: parse_uuid("call_records.id", &id)?,
        tenant_id: parse_uuid("call_records.tenant_id", &tenant_id)?,
        uniqueid: row.get("uniqueid"),
        source_number: row.get("source_number"),
        destination_number: row.get("destination_number"),
        started_at: parse_optional_timestamp(row.get("started_at"))?,
        duration_seconds: row.get("duration_seconds"),
        disposition,
        recording_ref: row.get("recording_ref"),
        pbx_system: PbxSystem::parse(&pbx_system)
            .ok_or_else(|| Error::Internal(format!("Unknown pbx_system: {}", pbx_system)))?,
        raw_payload: serde_json::from_str(&raw_payload)?,
        finalized_at: parse_optional_timestamp(row.get("finalized_at"))?,
        usage_charged: row.get::<i64, _>("usage_charged") != 0,
        minutes_charged: row.get("minutes_charged"),
        created_at: from_db_timestamp(&created_at)?,
        updated_at: from_db_timestamp(&updated_at)?,
    })
}

/// Insert or merge one CDR delivery keyed by (tenant_id, uniqueid)
///
/// Both paths are single statements:
/// - insert: `ON CONFLICT DO NOTHING RETURNING id`, a returned row means created
/// - merge: fills only still-empty fields; while the stored disposition is
///   empty the incoming duration wins, once final duration and disposition
///   are frozen. The statement that first sets a disposition also writes this
///   delivery's token, which is how `finalized_now` is detected.
pub async fn upsert_call(
    pool: &SqlitePool,
    lock_wait_ms: u64,
    tenant_id: Uuid,
    pbx_system: PbxSystem,
    cdr: &NormalizedCdr,
    raw_payload: &serde_json::Value,
) -> Result<UpsertOutcome> {
    // Prepare all bind values before touching the database
    let new_id = Uuid::new_v4();
    let new_id_str = new_id.to_string();
    let tenant_id_str = tenant_id.to_string();
    let token = Uuid::new_v4().to_string();
    let now = to_db_timestamp(Utc::now());
    let started_at = cdr.started_at.map(to_db_timestamp);
    let disposition = cdr.disposition.map(|d| d.as_str());
    let raw_payload = serde_json::to_string(raw_payload)?;
    let insert_token = disposition.map(|_| token.clone());
    let insert_finalized_at = disposition.map(|_| now.clone());

    let inserted: Option<String> = retry_on_lock("insert call record", lock_wait_ms, || async {
        let row = sqlx::query(
            r#"
            INSERT INTO call_records (
                id, tenant_id, uniqueid, source_number, destination_number, started_at,
                duration_seconds, disposition, recording_ref, pbx_system, raw_payload,
                finalize_token, finalized_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, uniqueid) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&new_id_str)
        .bind(&tenant_id_str)
        .bind(&cdr.uniqueid)
        .bind(&cdr.source_number)
        .bind(&cdr.destination_number)
        .bind(&started_at)
        .bind(cdr.duration_seconds)
        .bind(disposition)
        .bind(&cdr.recording_ref)
        .bind(pbx_system.as_str())
        .bind(&raw_payload)
        .bind(&insert_token)
        .bind(&insert_finalized_at)
        .bind(&now)
        .bind(&now)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| r.get::<String, _>("id")))
    })
    .await?;

    if inserted.is_some() {
        return Ok(UpsertOutcome {
            call_id: new_id,
            created: true,
            finalized_now: cdr.disposition.is_some(),
            disposition: cdr.disposition,
        });
    }

    let merged = retry_on_lock("merge call record", lock_wait_ms, || async {
        let row = sqlx::query(
            r#"
            UPDATE call_records SET
                source_number = COALESCE(NULLIF(source_number, ''), ?1),
                destination_number = COALESCE(NULLIF(destination_number, ''), ?2),
                started_at = COALESCE(started_at, ?3),
                recording_ref = COALESCE(NULLIF(recording_ref, ''), ?4),
                duration_seconds = CASE
                    WHEN disposition IS NULL THEN COALESCE(?5, duration_seconds)
                    ELSE COALESCE(duration_seconds, ?5)
                END,
                finalize_token = CASE
                    WHEN disposition IS NULL AND ?6 IS NOT NULL THEN ?7
                    ELSE finalize_token
                END,
                finalized_at = CASE
                    WHEN disposition IS NULL AND ?6 IS NOT NULL THEN ?8
                    ELSE finalized_at
                END,
                disposition = COALESCE(disposition, ?6),
                updated_at = ?8
            WHERE tenant_id = ?9 AND uniqueid = ?10
            RETURNING id, disposition, finalize_token
            "#,
        )
        .bind(&cdr.source_number)
        .bind(&cdr.destination_number)
        .bind(&started_at)
        .bind(&cdr.recording_ref)
        .bind(cdr.duration_seconds)
        .bind(disposition)
        .bind(&token)
        .bind(&now)
        .bind(&tenant_id_str)
        .bind(&cdr.uniqueid)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|r| {
            (
                r.get::<String, _>("id"),
                r.get::<Option<String>, _>("disposition"),
                r.get::<Option<String>, _>("finalize_token"),
            )
        }))
    })
    .await?;

    let (id, stored_disposition, stored_token) = merged.ok_or_else(|| {
        Error::Internal(format!(
            "Call record {} vanished between insert and merge",
            cdr.uniqueid
        ))
    })?;

    Ok(UpsertOutcome {
        call_id: parse_uuid("call_records.id", &id)?,
        created: false,
        finalized_now: stored_token.as_deref() == Some(token.as_str()),
        disposition: stored_disposition.as_deref().and_then(Disposition::from_db),
    })
}

pub async fn load_call(pool: &SqlitePool, call_id: Uuid) -> Result<Option<CallRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM call_records WHERE id = ?", CALL_COLUMNS))
        .bind(call_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(call_from_row).transpose()
}

pub async fn load_by_uniqueid(
    pool: &SqlitePool,
    tenant_id: Uuid,
    uniqueid: &str,
) -> Result<Option<CallRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM call_records WHERE tenant_id = ? AND uniqueid = ?",
        CALL_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(uniqueid)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(call_from_row).transpose()
}

/// Most recent calls for one tenant, newest first
pub async fn list_recent_calls(
    pool: &SqlitePool,
    tenant_id: Uuid,
    limit: i64,
) -> Result<Vec<CallRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM call_records WHERE tenant_id = ? ORDER BY created_at DESC, id LIMIT ?",
        CALL_COLUMNS
    ))
    .bind(tenant_id.to_string())
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(call_from_row).collect()
}

/// Flip the calls-processed charge marker; returns false if it already had that value
pub async fn set_usage_charged(pool: &SqlitePool, call_id: Uuid, charged: bool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE call_records SET usage_charged = ?1 WHERE id = ?2 AND usage_charged != ?1",
    )
    .bind(charged as i64)
    .bind(call_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Compare-and-set the transcription minutes marker; returns false if it did not hold `expected`
pub async fn swap_minutes_charged(
    pool: &SqlitePool,
    call_id: Uuid,
    expected: i64,
    minutes: i64,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE call_records SET minutes_charged = ? WHERE id = ? AND minutes_charged = ?",
    )
    .bind(minutes)
    .bind(call_id.to_string())
    .bind(expected)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn count_calls(pool: &SqlitePool, tenant_id: Uuid) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM call_records WHERE tenant_id = ?")
        .bind(tenant_id.to_string())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
