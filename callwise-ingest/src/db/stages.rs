//! Stage result persistence and compliance alerts

use callwise_common::time::{from_db_timestamp, to_db_timestamp};
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

use super::{parse_optional_timestamp, parse_optional_uuid, parse_uuid};
use crate::models::{
    ComplianceAlert, ComplianceFinding, ResolvedPrompt, Severity, Stage, StageOutput, StageResult,
    StageState,
};

fn stage_from_row(row: &SqliteRow) -> Result<StageResult> {
    let call_id: String = row.get("call_id");
    let stage: String = row.get("stage");
    let state: String = row.get("state");
    let output: Option<String> = row.get("output");

    Ok(StageResult {
        call_id: parse_uuid("stage_results.call_id", &call_id)?,
        stage: Stage::parse(&stage)
            .ok_or_else(|| Error::Internal(format!("Unknown stage: {}", stage)))?,
        state: StageState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown stage state: {}", state)))?,
        attempts: row.get("attempts"),
        error: row.get("error"),
        prompt_source: row.get("prompt_source"),
        prompt_customization_id: parse_optional_uuid(
            "stage_results.prompt_customization_id",
            row.get("prompt_customization_id"),
        )?,
        prompt_version: row.get("prompt_version"),
        prompt_identity: row.get("prompt_identity"),
        output: output.map(|o| serde_json::from_str(&o)).transpose()?,
        started_at: parse_optional_timestamp(row.get("started_at"))?,
        finished_at: parse_optional_timestamp(row.get("finished_at"))?,
    })
}

/// Create `pending` rows for all five stages (existing rows untouched)
pub async fn init_stage_rows(pool: &SqlitePool, call_id: Uuid) -> Result<()> {
    let now = to_db_timestamp(Utc::now());
    let call_id = call_id.to_string();

    for stage in Stage::ALL {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO stage_results (call_id, stage, state, updated_at)
            VALUES (?, ?, 'pending', ?)
            "#,
        )
        .bind(&call_id)
        .bind(stage.as_str())
        .bind(&now)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn load_stage_results(pool: &SqlitePool, call_id: Uuid) -> Result<Vec<StageResult>> {
    let rows = sqlx::query(
        r#"
        SELECT call_id, stage, state, attempts, error, prompt_source, prompt_customization_id,
               prompt_version, prompt_identity, output, started_at, finished_at
        FROM stage_results WHERE call_id = ?
        ORDER BY CASE stage
            WHEN 'transcription' THEN 0
            WHEN 'sentiment' THEN 1
            WHEN 'quality' THEN 2
            WHEN 'compliance' THEN 3
            ELSE 4
        END
        "#,
    )
    .bind(call_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(stage_from_row).collect()
}

pub async fn load_stage_result(
    pool: &SqlitePool,
    call_id: Uuid,
    stage: Stage,
) -> Result<Option<StageResult>> {
    let row = sqlx::query(
        r#"
        SELECT call_id, stage, state, attempts, error, prompt_source, prompt_customization_id,
               prompt_version, prompt_identity, output, started_at, finished_at
        FROM stage_results WHERE call_id = ? AND stage = ?
        "#,
    )
    .bind(call_id.to_string())
    .bind(stage.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(stage_from_row).transpose()
}

/// `pending → running`; false if the stage was not pending
pub async fn try_mark_running(pool: &SqlitePool, call_id: Uuid, stage: Stage) -> Result<bool> {
    let now = to_db_timestamp(Utc::now());
    let result = sqlx::query(
        r#"
        UPDATE stage_results
        SET state = 'running', started_at = ?, finished_at = NULL, error = NULL, updated_at = ?
        WHERE call_id = ? AND stage = ? AND state = 'pending'
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(call_id.to_string())
    .bind(stage.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// `running → pending` after an error interrupted the stage; records the error
pub async fn release_running(pool: &SqlitePool, call_id: Uuid, stage: Stage, error: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_results
        SET state = 'pending', started_at = NULL, error = ?, updated_at = ?
        WHERE call_id = ? AND stage = ? AND state = 'running'
        "#,
    )
    .bind(error)
    .bind(to_db_timestamp(Utc::now()))
    .bind(call_id.to_string())
    .bind(stage.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal outcome of one stage execution
#[derive(Debug, Clone)]
pub struct StageCompletion<'a> {
    pub state: StageState,
    pub attempts: u32,
    pub error: Option<String>,
    pub prompt: Option<&'a ResolvedPrompt>,
    pub output: Option<StageOutput>,
}

/// Move a pending/running stage to a terminal state
///
/// Returns false when the stage already was terminal.
pub async fn finish_stage(
    pool: &SqlitePool,
    call_id: Uuid,
    stage: Stage,
    completion: StageCompletion<'_>,
) -> Result<bool> {
    debug_assert!(completion.state.is_terminal());

    let now = to_db_timestamp(Utc::now());
    let output = completion
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let prompt = completion.prompt;

    let result = sqlx::query(
        r#"
        UPDATE stage_results SET
            state = ?, attempts = attempts + ?, error = ?,
            prompt_source = ?, prompt_customization_id = ?, prompt_version = ?, prompt_identity = ?,
            output = ?, finished_at = ?, updated_at = ?
        WHERE call_id = ? AND stage = ? AND state IN ('pending', 'running')
        "#,
    )
    .bind(completion.state.as_str())
    .bind(completion.attempts as i64)
    .bind(&completion.error)
    .bind(prompt.map(|p| p.source.as_str()))
    .bind(prompt.and_then(|p| p.customization_id).map(|id| id.to_string()))
    .bind(prompt.map(|p| p.version))
    .bind(prompt.map(|p| p.identity()))
    .bind(output)
    .bind(&now)
    .bind(&now)
    .bind(call_id.to_string())
    .bind(stage.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal → pending for a manual reprocess; false if the stage is not terminal
pub async fn reset_stage(pool: &SqlitePool, call_id: Uuid, stage: Stage) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE stage_results SET
            state = 'pending', error = NULL, output = NULL,
            started_at = NULL, finished_at = NULL, updated_at = ?
        WHERE call_id = ? AND stage = ? AND state NOT IN ('pending', 'running')
        "#,
    )
    .bind(to_db_timestamp(Utc::now()))
    .bind(call_id.to_string())
    .bind(stage.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Return interrupted stages to `pending` (startup recovery)
pub async fn recover_running_stages(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE stage_results SET state = 'pending', started_at = NULL, updated_at = ? WHERE state = 'running'",
    )
    .bind(to_db_timestamp(Utc::now()))
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Replace the call's compliance alerts with a new set (one transaction)
pub async fn replace_compliance_alerts(
    pool: &SqlitePool,
    call_id: Uuid,
    findings: &[ComplianceFinding],
    prompt_identity: &str,
) -> Result<()> {
    let now = to_db_timestamp(Utc::now());
    let call_id = call_id.to_string();

    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM compliance_alerts WHERE call_id = ?")
        .bind(&call_id)
        .execute(&mut *tx)
        .await?;

    for finding in findings {
        sqlx::query(
            r#"
            INSERT INTO compliance_alerts (call_id, rule, severity, excerpt, prompt_identity, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&call_id)
        .bind(&finding.rule)
        .bind(finding.severity.as_str())
        .bind(&finding.excerpt)
        .bind(prompt_identity)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn load_compliance_alerts(
    pool: &SqlitePool,
    call_id: Uuid,
) -> Result<Vec<ComplianceAlert>> {
    let rows = sqlx::query(
        r#"
        SELECT id, call_id, rule, severity, excerpt, prompt_identity, created_at
        FROM compliance_alerts WHERE call_id = ? ORDER BY id
        "#,
    )
    .bind(call_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let call_id: String = row.get("call_id");
            let severity: String = row.get("severity");
            let created_at: String = row.get("created_at");
            Ok(ComplianceAlert {
                id: row.get("id"),
                call_id: parse_uuid("compliance_alerts.call_id", &call_id)?,
                rule: row.get("rule"),
                severity: Severity::parse(&severity)
                    .ok_or_else(|| Error::Internal(format!("Unknown severity: {}", severity)))?,
                excerpt: row.get("excerpt"),
                prompt_identity: row.get("prompt_identity"),
                created_at: from_db_timestamp(&created_at)?,
            })
        })
        .collect()
}
