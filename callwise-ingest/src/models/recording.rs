//! Recording fetch state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Pending,
    Fetched,
    /// Permanent rejection or retries exhausted
    Failed,
    /// PBX reports no such recording, or the CDR carries no reference
    Unavailable,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Pending => "pending",
            RecordingState::Fetched => "fetched",
            RecordingState::Failed => "failed",
            RecordingState::Unavailable => "unavailable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RecordingState::Pending),
            "fetched" => Some(RecordingState::Fetched),
            "failed" => Some(RecordingState::Failed),
            "unavailable" => Some(RecordingState::Unavailable),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordingState::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Recording {
    pub call_id: Uuid,
    pub tenant_id: Uuid,
    pub state: RecordingState,
    pub file_path: Option<String>,
    pub size_bytes: Option<i64>,
    pub content_type: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}
