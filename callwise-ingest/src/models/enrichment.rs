//! Enrichment stages and their results
//!
//! Stage order is fixed: transcription first, then the four analysis stages
//! which only need the transcript and run concurrently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Transcription,
    Sentiment,
    Quality,
    Compliance,
    Summary,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Transcription,
        Stage::Sentiment,
        Stage::Quality,
        Stage::Compliance,
        Stage::Summary,
    ];

    /// Stages that consume the transcript
    pub const DOWNSTREAM: [Stage; 4] = [
        Stage::Sentiment,
        Stage::Quality,
        Stage::Compliance,
        Stage::Summary,
    ];

    /// Stage name, also used as the prompt feature slug
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Transcription => "transcription",
            Stage::Sentiment => "sentiment",
            Stage::Quality => "quality",
            Stage::Compliance => "compliance",
            Stage::Summary => "summary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Stage::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Feature flag gating this stage
    pub fn flag_key(&self) -> String {
        format!("stage.{}", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per (call, stage) state machine
///
/// `pending → running → {succeeded | failed | skipped_*}`; only a manual
/// reprocess moves a terminal stage back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    SkippedQuota,
    SkippedDependency,
    SkippedDisabled,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Succeeded => "succeeded",
            StageState::Failed => "failed",
            StageState::SkippedQuota => "skipped_quota",
            StageState::SkippedDependency => "skipped_dependency",
            StageState::SkippedDisabled => "skipped_disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(StageState::Pending),
            "running" => Some(StageState::Running),
            "succeeded" => Some(StageState::Succeeded),
            "failed" => Some(StageState::Failed),
            "skipped_quota" => Some(StageState::SkippedQuota),
            "skipped_dependency" => Some(StageState::SkippedDependency),
            "skipped_disabled" => Some(StageState::SkippedDisabled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageState::Pending | StageState::Running)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            StageState::SkippedQuota | StageState::SkippedDependency | StageState::SkippedDisabled
        )
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// One compliance issue reported by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceFinding {
    pub rule: String,
    pub severity: Severity,
    #[serde(default)]
    pub excerpt: Option<String>,
}

/// Persisted compliance alert, tagged with the prompt that produced it
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceAlert {
    pub id: i64,
    pub call_id: Uuid,
    pub rule: String,
    pub severity: Severity,
    pub excerpt: Option<String>,
    pub prompt_identity: String,
    pub created_at: DateTime<Utc>,
}

/// Typed stage output stored with the stage result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutput {
    Transcription {
        text: String,
        language: Option<String>,
        billed_minutes: i64,
    },
    Sentiment {
        label: SentimentLabel,
        score: f64,
    },
    Quality {
        score: u8,
        rationale: String,
    },
    /// Alerts themselves live in `compliance_alerts`
    Compliance {
        alert_count: usize,
    },
    Summary {
        text: String,
    },
}

impl StageOutput {
    /// Transcript text, when this is a transcription output
    pub fn transcript(&self) -> Option<&str> {
        match self {
            StageOutput::Transcription { text, .. } => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub call_id: Uuid,
    pub stage: Stage,
    pub state: StageState,
    pub attempts: i64,
    pub error: Option<String>,
    pub prompt_source: Option<String>,
    pub prompt_customization_id: Option<Uuid>,
    pub prompt_version: Option<i64>,
    pub prompt_identity: Option<String>,
    pub output: Option<StageOutput>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
