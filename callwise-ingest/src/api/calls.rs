//! Consumer API: calls, enrichment results and reprocessing

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db,
    error::{ApiError, ApiResult},
    models::{CallRecord, ComplianceAlert, Recording, Stage, StageResult, TaskKind, TaskState},
    AppState,
};

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

/// GET /calls/:id response
#[derive(Debug, Serialize)]
pub struct CallDetailResponse {
    pub call: CallRecord,
    pub recording: Option<Recording>,
    pub stages: Vec<StageResult>,
    pub compliance_alerts: Vec<ComplianceAlert>,
}

#[derive(Debug, Deserialize)]
pub struct ListCallsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListCallsResponse {
    pub tenant_id: Uuid,
    pub calls: Vec<CallRecord>,
}

/// POST /calls/:id/stages/:stage/reprocess response
#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub status: String,
    pub call_id: Uuid,
    pub stage: Stage,
    /// False when an identical reprocess request is already queued
    pub task_created: bool,
}

pub(crate) fn parse_stage(value: &str) -> ApiResult<Stage> {
    Stage::parse(value).ok_or_else(|| ApiError::BadRequest(format!("Unknown feature: {}", value)))
}

async fn load_call(state: &AppState, call_id: Uuid) -> ApiResult<CallRecord> {
    db::calls::load_call(&state.db, call_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Call {}", call_id)))
}

/// GET /calls/:id
pub async fn get_call(
    State(state): State<AppState>,
    Path(call_id): Path<Uuid>,
) -> ApiResult<Json<CallDetailResponse>> {
    let call = load_call(&state, call_id).await?;
    let recording = db::recordings::load_recording(&state.db, call_id).await?;
    let stages = db::stages::load_stage_results(&state.db, call_id).await?;
    let compliance_alerts = db::stages::load_compliance_alerts(&state.db, call_id).await?;

    Ok(Json(CallDetailResponse {
        call,
        recording,
        stages,
        compliance_alerts,
    }))
}

/// GET /tenants/:tenant_id/calls?limit=
pub async fn list_calls(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListCallsQuery>,
) -> ApiResult<Json<ListCallsResponse>> {
    if state.tenants.get(tenant_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Tenant {}", tenant_id)));
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let calls = db::calls::list_recent_calls(&state.db, tenant_id, limit).await?;

    Ok(Json(ListCallsResponse { tenant_id, calls }))
}

/// POST /calls/:id/stages/:stage/reprocess
///
/// Resets one terminal stage to pending and queues a single-stage task.
/// A stage that is pending or running answers 409, unless it is pending
/// because of an earlier reprocess request that is still queued.
pub async fn reprocess_stage(
    State(state): State<AppState>,
    Path((call_id, stage)): Path<(Uuid, String)>,
) -> ApiResult<Json<ReprocessResponse>> {
    let stage = parse_stage(&stage)?;
    let call = load_call(&state, call_id).await?;

    let current = db::stages::load_stage_result(&state.db, call_id, stage)
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("Stage {} has not run yet for call {}", stage, call_id)))?;

    if !current.state.is_terminal() {
        let queued = db::tasks::tasks_for_call(&state.db, call_id)
            .await?
            .into_iter()
            .any(|t| t.kind == TaskKind::Reprocess(stage) && t.state == TaskState::Pending);
        if queued {
            return Ok(Json(ReprocessResponse {
                status: "scheduled".to_string(),
                call_id,
                stage,
                task_created: false,
            }));
        }
        return Err(ApiError::Conflict(format!(
            "Stage {} is {} for call {}",
            stage, current.state, call_id
        )));
    }

    if !db::stages::reset_stage(&state.db, call_id, stage).await? {
        return Err(ApiError::Conflict(format!("Stage {} changed state concurrently", stage)));
    }
    if stage == Stage::Transcription {
        if call.minutes_charged > 0 {
            // The new run is billed on its own
            db::calls::swap_minutes_charged(&state.db, call_id, call.minutes_charged, 0).await?;
        }
        if db::recordings::reset_failed(&state.db, call_id).await? {
            tracing::info!(call_id = %call_id, "Failed recording will be fetched again");
        }
    }
    let task_created = state.queue.enqueue_reprocess(call_id, call.tenant_id, stage).await?;

    tracing::info!(call_id = %call_id, stage = %stage, task_created, "Stage reprocess requested");

    Ok(Json(ReprocessResponse {
        status: "scheduled".to_string(),
        call_id,
        stage,
        task_created,
    }))
}

pub fn call_routes() -> Router<AppState> {
    Router::new()
        .route("/calls/:id", get(get_call))
        .route("/tenants/:tenant_id/calls", get(list_calls))
        .route("/calls/:id/stages/:stage/reprocess", post(reprocess_stage))
}
