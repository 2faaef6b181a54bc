//! Persisted enrichment work queue entries

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskKind {
    /// Full pipeline for a newly final call (one per call, ever)
    Pipeline,
    /// Manual re-run of one stage
    Reprocess(Stage),
}

impl TaskKind {
    pub fn to_db(&self) -> String {
        match self {
            TaskKind::Pipeline => "pipeline".to_string(),
            TaskKind::Reprocess(stage) => format!("reprocess:{}", stage),
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        if value == "pipeline" {
            return Some(TaskKind::Pipeline);
        }
        value
            .strip_prefix("reprocess:")
            .and_then(Stage::parse)
            .map(TaskKind::Reprocess)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Done,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Done => "done",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "done" => Some(TaskState::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentTask {
    pub id: i64,
    pub call_id: Uuid,
    pub tenant_id: Uuid,
    pub kind: TaskKind,
    pub state: TaskState,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_kind_db_form() {
        assert_eq!(TaskKind::Pipeline.to_db(), "pipeline");
        assert_eq!(TaskKind::Reprocess(Stage::Summary).to_db(), "reprocess:summary");
        assert_eq!(
            TaskKind::from_db("reprocess:quality"),
            Some(TaskKind::Reprocess(Stage::Quality))
        );
        assert_eq!(TaskKind::from_db("reprocess:bogus"), None);
        assert_eq!(TaskKind::from_db("pipeline"), Some(TaskKind::Pipeline));
    }
}
