//! Operator alert persistence

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_optional_uuid};
use crate::models::{AlertKind, OperatorAlert};

fn alert_from_row(row: &SqliteRow) -> Result<OperatorAlert> {
    let kind: String = row.get("kind");
    let raised_at: String = row.get("raised_at");
    let last_seen_at: String = row.get("last_seen_at");

    Ok(OperatorAlert {
        id: row.get("id"),
        tenant_id: parse_optional_uuid("alerts.tenant_id", row.get("tenant_id"))?,
        kind: AlertKind::parse(&kind)
            .ok_or_else(|| Error::Internal(format!("Unknown alert kind: {}", kind)))?,
        message: row.get("message"),
        occurrences: row.get("occurrences"),
        raised_at: from_db_timestamp(&raised_at)?,
        last_seen_at: from_db_timestamp(&last_seen_at)?,
        acknowledged_at: parse_optional_timestamp(row.get("acknowledged_at"))?,
    })
}

/// Id of the open (unacknowledged) alert for (tenant, kind)
pub async fn find_open(
    pool: &SqlitePool,
    tenant_id: Option<Uuid>,
    kind: AlertKind,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar(
        r#"
        SELECT id FROM alerts
        WHERE tenant_id IS ? AND kind = ? AND acknowledged_at IS NULL
        ORDER BY id DESC LIMIT 1
        "#,
    )
    .bind(tenant_id.map(|t| t.to_string()))
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;

    Ok(id)
}

pub async fn insert_alert(
    pool: &SqlitePool,
    tenant_id: Option<Uuid>,
    kind: AlertKind,
    message: &str,
    occurrences: i64,
    now: DateTime<Utc>,
) -> Result<i64> {
    let timestamp = to_db_timestamp(now);
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO alerts (tenant_id, kind, message, occurrences, raised_at, last_seen_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(tenant_id.map(|t| t.to_string()))
    .bind(kind.as_str())
    .bind(message)
    .bind(occurrences)
    .bind(&timestamp)
    .bind(&timestamp)
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Absorb another occurrence into an open alert
pub async fn bump_occurrence(
    pool: &SqlitePool,
    alert_id: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE alerts SET occurrences = occurrences + 1, message = ?, last_seen_at = ? WHERE id = ?",
    )
    .bind(message)
    .bind(to_db_timestamp(now))
    .bind(alert_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_alerts(pool: &SqlitePool, include_acknowledged: bool) -> Result<Vec<OperatorAlert>> {
    let sql = if include_acknowledged {
        "SELECT id, tenant_id, kind, message, occurrences, raised_at, last_seen_at, acknowledged_at \
         FROM alerts ORDER BY id DESC"
    } else {
        "SELECT id, tenant_id, kind, message, occurrences, raised_at, last_seen_at, acknowledged_at \
         FROM alerts WHERE acknowledged_at IS NULL ORDER BY id DESC"
    };

    let rows = sqlx::query(sql).fetch_all(pool).await?;
    rows.iter().map(alert_from_row).collect()
}

/// Returns false if the alert does not exist or was already acknowledged
pub async fn acknowledge(pool: &SqlitePool, alert_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE alerts SET acknowledged_at = ? WHERE id = ? AND acknowledged_at IS NULL",
    )
    .bind(to_db_timestamp(Utc::now()))
    .bind(alert_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
