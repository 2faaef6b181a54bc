//! PBX webhook endpoint
//!
//! POST /webhook/cdr/:routing_key with HTTP Basic credentials

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    routing::post,
    Json, Router,
};

use crate::{error::ApiResult, services::IngestReceipt, AppState};

/// POST /webhook/cdr/:routing_key
///
/// 200 for new and duplicate deliveries, 401 for bad credentials, 400 for
/// payloads that can never be accepted. The body is read raw so that JSON
/// errors are answered by the gateway (and counted) rather than the extractor.
pub async fn receive_cdr(
    State(state): State<AppState>,
    Path(routing_key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<IngestReceipt>> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let receipt = state.gateway.ingest(&routing_key, authorization, &body).await?;
    Ok(Json(receipt))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/cdr/:routing_key", post(receive_cdr))
}
