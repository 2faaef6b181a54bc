//! Operator alerts

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Signal categories tracked by the alerting component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RecordingFetchFailure,
    StageFailure,
    QuotaExceeded,
    MalformedPayload,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::RecordingFetchFailure => "recording_fetch_failure",
            AlertKind::StageFailure => "stage_failure",
            AlertKind::QuotaExceeded => "quota_exceeded",
            AlertKind::MalformedPayload => "malformed_payload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recording_fetch_failure" => Some(AlertKind::RecordingFetchFailure),
            "stage_failure" => Some(AlertKind::StageFailure),
            "quota_exceeded" => Some(AlertKind::QuotaExceeded),
            "malformed_payload" => Some(AlertKind::MalformedPayload),
            _ => None,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorAlert {
    pub id: i64,
    pub tenant_id: Option<Uuid>,
    pub kind: AlertKind,
    pub message: String,
    pub occurrences: i64,
    pub raised_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}
