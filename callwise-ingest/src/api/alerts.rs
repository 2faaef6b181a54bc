//! Operator alert API

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ApiError, ApiResult},
    models::OperatorAlert,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    #[serde(default)]
    pub include_acknowledged: bool,
}

#[derive(Debug, Serialize)]
pub struct ListAlertsResponse {
    pub alerts: Vec<OperatorAlert>,
}

#[derive(Debug, Serialize)]
pub struct AcknowledgeResponse {
    pub id: i64,
    pub acknowledged: bool,
}

/// GET /alerts?include_acknowledged=
///
/// Open alerts only unless `include_acknowledged=true`.
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> ApiResult<Json<ListAlertsResponse>> {
    let alerts = state.alerting.list(query.include_acknowledged).await?;
    Ok(Json(ListAlertsResponse { alerts }))
}

/// POST /alerts/:id/ack
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<AcknowledgeResponse>> {
    if !state.alerting.acknowledge(id).await? {
        return Err(ApiError::NotFound(format!("Open alert {}", id)));
    }
    tracing::info!(alert_id = id, "Alert acknowledged");
    Ok(Json(AcknowledgeResponse {
        id,
        acknowledged: true,
    }))
}

pub fn alert_routes() -> Router<AppState> {
    Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/:id/ack", post(acknowledge_alert))
}
