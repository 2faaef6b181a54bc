//! Plan lookups

use callwise_common::Result;
use sqlx::{Row, SqlitePool};

use crate::models::{Plan, PlanLimits};

pub async fn load_plan(pool: &SqlitePool, plan_id: &str) -> Result<Option<Plan>> {
    let row = sqlx::query(
        r#"
        SELECT id, name, max_calls_processed, max_transcription_minutes,
               max_storage_bytes, max_api_calls
        FROM plans WHERE id = ?
        "#,
    )
    .bind(plan_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| Plan {
        id: row.get("id"),
        name: row.get("name"),
        limits: PlanLimits {
            calls_processed: row.get("max_calls_processed"),
            transcription_minutes: row.get("max_transcription_minutes"),
            storage_bytes: row.get("max_storage_bytes"),
            api_calls: row.get("max_api_calls"),
        },
    }))
}

/// Create or replace a plan definition
pub async fn upsert_plan(pool: &SqlitePool, plan: &Plan) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO plans (id, name, max_calls_processed, max_transcription_minutes,
                           max_storage_bytes, max_api_calls)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            max_calls_processed = excluded.max_calls_processed,
            max_transcription_minutes = excluded.max_transcription_minutes,
            max_storage_bytes = excluded.max_storage_bytes,
            max_api_calls = excluded.max_api_calls
        "#,
    )
    .bind(&plan.id)
    .bind(&plan.name)
    .bind(plan.limits.calls_processed)
    .bind(plan.limits.transcription_minutes)
    .bind(plan.limits.storage_bytes)
    .bind(plan.limits.api_calls)
    .execute(pool)
    .await?;

    Ok(())
}
