//! Error types for callwise-ingest
//!
//! `PipelineError` is the per-unit failure taxonomy (one delivery, one
//! recording, one stage). `ApiError` is what HTTP handlers return.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::models::{QuotaDecision, Stage, UsageCounterKind};
use crate::utils::backoff::Retryable;

/// Failure of one pipeline unit
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unknown/suspended tenant or bad credentials; answered 401, not retried
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// CDR body could not be parsed; answered 400, not retried
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// PBX has no such recording (permanent)
    #[error("Recording unavailable: {0}")]
    RecordingUnavailable(String),

    /// PBX rejected the download (credentials, other 4xx); permanent
    #[error("Recording fetch rejected: {0}")]
    RecordingRejected(String),

    /// Network error, timeout or PBX 5xx/429; retried with backoff
    #[error("Transient fetch error: {0}")]
    TransientFetch(String),

    /// AI engine failure for one stage
    #[error("Stage {stage} failed: {message}")]
    EnrichmentStage {
        stage: Stage,
        message: String,
        transient: bool,
    },

    /// Plan limit reached; advisory, the stage is skipped
    #[error("{} quota exhausted ({used} of {limit} used, {requested} requested)", .counter.column())]
    QuotaExceeded {
        counter: UsageCounterKind,
        limit: i64,
        used: i64,
        requested: i64,
    },

    #[error(transparent)]
    Common(#[from] callwise_common::Error),
}

impl PipelineError {
    /// The advisory error for a denied quota check; `None` when allowed
    pub fn from_quota(decision: QuotaDecision, counter: UsageCounterKind, requested: i64) -> Option<Self> {
        match decision {
            QuotaDecision::Allowed => None,
            QuotaDecision::Denied { limit, used } => Some(PipelineError::QuotaExceeded {
                counter,
                limit,
                used,
                requested,
            }),
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Common(callwise_common::Error::Database(err))
    }
}

impl Retryable for PipelineError {
    fn is_transient(&self) -> bool {
        match self {
            PipelineError::TransientFetch(_) => true,
            PipelineError::EnrichmentStage { transient, .. } => *transient,
            _ => false,
        }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid webhook credentials (401)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. reprocessing a stage that is still running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// callwise-common error
    #[error("Common error: {0}")]
    Common(#[from] callwise_common::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Authentication(msg) => ApiError::Unauthorized(msg),
            PipelineError::MalformedPayload(msg) => ApiError::BadRequest(msg),
            PipelineError::Common(common) => ApiError::from(common),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Common(callwise_common::Error::Database(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(callwise_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(callwise_common::Error::InvalidInput(msg)) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg)
            }
            ApiError::Common(ref err) => {
                tracing::error!(error = %err, "Request failed with internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "COMMON_ERROR",
                    err.to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_errors_map_to_gateway_statuses() {
        let auth: ApiError = PipelineError::Authentication("bad secret".into()).into();
        assert_eq!(auth.into_response().status(), StatusCode::UNAUTHORIZED);

        let malformed: ApiError = PipelineError::MalformedPayload("no uniqueid".into()).into();
        assert_eq!(malformed.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_common_not_found_is_404() {
        let err: ApiError = callwise_common::Error::NotFound("call".into()).into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(PipelineError::TransientFetch("timeout".into()).is_transient());
        assert!(!PipelineError::RecordingUnavailable("404".into()).is_transient());
        assert!(PipelineError::EnrichmentStage {
            stage: Stage::Summary,
            message: "503".into(),
            transient: true,
        }
        .is_transient());
        assert!(!PipelineError::EnrichmentStage {
            stage: Stage::Summary,
            message: "400".into(),
            transient: false,
        }
        .is_transient());
    }

    #[test]
    fn test_quota_denial_reads_as_skip_reason() {
        let allowed = PipelineError::from_quota(QuotaDecision::Allowed, UsageCounterKind::ApiCalls, 1);
        assert!(allowed.is_none());

        let denied = PipelineError::from_quota(
            QuotaDecision::Denied { limit: 3, used: 3 },
            UsageCounterKind::TranscriptionMinutes,
            2,
        )
        .unwrap();
        assert!(!denied.is_transient());
        assert_eq!(
            denied.to_string(),
            "transcription_minutes quota exhausted (3 of 3 used, 2 requested)"
        );
    }
}
