//! Plans, usage counters and quota decisions

use serde::Serialize;
use uuid::Uuid;

/// Metered counters, one column each in `usage_counters`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageCounterKind {
    CallsProcessed,
    TranscriptionMinutes,
    StorageBytes,
    ApiCalls,
}

impl UsageCounterKind {
    /// Column name in `usage_counters` (fixed set, safe to interpolate)
    pub fn column(&self) -> &'static str {
        match self {
            UsageCounterKind::CallsProcessed => "calls_processed",
            UsageCounterKind::TranscriptionMinutes => "transcription_minutes",
            UsageCounterKind::StorageBytes => "storage_bytes",
            UsageCounterKind::ApiCalls => "api_calls",
        }
    }
}

/// Monthly limits; `None` means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub calls_processed: Option<i64>,
    pub transcription_minutes: Option<i64>,
    pub storage_bytes: Option<i64>,
    pub api_calls: Option<i64>,
}

impl PlanLimits {
    pub fn limit_for(&self, counter: UsageCounterKind) -> Option<i64> {
        match counter {
            UsageCounterKind::CallsProcessed => self.calls_processed,
            UsageCounterKind::TranscriptionMinutes => self.transcription_minutes,
            UsageCounterKind::StorageBytes => self.storage_bytes,
            UsageCounterKind::ApiCalls => self.api_calls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub limits: PlanLimits,
}

/// Outcome of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed,
    Denied { limit: i64, used: i64 },
}

/// Current-period usage for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub tenant_id: Uuid,
    pub plan_id: String,
    pub period: String,
    pub calls_processed: i64,
    pub transcription_minutes: i64,
    pub storage_bytes: i64,
    pub api_calls: i64,
    pub limits: PlanLimits,
}

