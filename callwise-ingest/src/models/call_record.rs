//! Call detail record model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PbxSystem;

/// Final call disposition
///
/// A call that is still ringing or in progress has no disposition yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Answered,
    NoAnswer,
    Busy,
    Failed,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Answered => "answered",
            Disposition::NoAnswer => "no_answer",
            Disposition::Busy => "busy",
            Disposition::Failed => "failed",
        }
    }

    /// Parse a stored (already normalized) value
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "answered" => Some(Disposition::Answered),
            "no_answer" => Some(Disposition::NoAnswer),
            "busy" => Some(Disposition::Busy),
            "failed" => Some(Disposition::Failed),
            _ => None,
        }
    }
}

/// Vendor-independent CDR produced by the normalizer
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCdr {
    pub uniqueid: String,
    pub source_number: Option<String>,
    pub destination_number: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub disposition: Option<Disposition>,
    pub recording_ref: Option<String>,
}

/// Persisted call record
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub uniqueid: String,
    pub source_number: Option<String>,
    pub destination_number: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub disposition: Option<Disposition>,
    pub recording_ref: Option<String>,
    pub pbx_system: PbxSystem,
    /// Body of the first delivery, kept verbatim
    pub raw_payload: serde_json::Value,
    pub finalized_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub usage_charged: bool,
    /// Transcription minutes reserved for the current transcription run
    #[serde(skip)]
    pub minutes_charged: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    /// Minutes billed for transcription: ceil(duration / 60), at least one
    pub fn billable_minutes(&self) -> i64 {
        let seconds = self.duration_seconds.unwrap_or(0).max(0);
        (seconds.saturating_add(59) / 60).max(1)
    }
}

/// Result of the idempotent CDR upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub call_id: Uuid,
    /// True when this delivery inserted the record
    pub created: bool,
    /// True when this delivery gave the record its final disposition
    /// (including a record created already final)
    pub finalized_now: bool,
    pub disposition: Option<Disposition>,
}

impl UpsertOutcome {
    /// Enrichment is scheduled exactly once: by the delivery that made the call final
    pub fn schedules_enrichment(&self) -> bool {
        self.finalized_now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with_duration(duration: Option<i64>) -> CallRecord {
        let now = Utc::now();
        CallRecord {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            uniqueid: "1".to_string(),
            source_number: None,
            destination_number: None,
            started_at: None,
            duration_seconds: duration,
            disposition: Some(Disposition::Answered),
            recording_ref: None,
            pbx_system: PbxSystem::Generic,
            raw_payload: serde_json::Value::Null,
            finalized_at: None,
            usage_charged: false,
            minutes_charged: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_billable_minutes_round_up() {
        assert_eq!(record_with_duration(Some(125)).billable_minutes(), 3);
        assert_eq!(record_with_duration(Some(120)).billable_minutes(), 2);
        assert_eq!(record_with_duration(Some(1)).billable_minutes(), 1);
    }

    #[test]
    fn test_billable_minutes_minimum_one() {
        assert_eq!(record_with_duration(Some(0)).billable_minutes(), 1);
        assert_eq!(record_with_duration(None).billable_minutes(), 1);
    }

    #[test]
    fn test_billable_minutes_saturate_on_huge_duration() {
        assert_eq!(
            record_with_duration(Some(i64::MAX)).billable_minutes(),
            i64::MAX / 60
        );
    }
}
