//! Data models for callwise-ingest

pub mod alert;
pub mod call_record;
pub mod enrichment;
pub mod feature_flag;
pub mod plan;
pub mod prompt;
pub mod recording;
pub mod task;
pub mod tenant;

pub use alert::{AlertKind, OperatorAlert};
pub use call_record::{CallRecord, Disposition, NormalizedCdr, UpsertOutcome};
pub use enrichment::{
    ComplianceAlert, ComplianceFinding, SentimentLabel, Severity, Stage, StageOutput, StageResult,
    StageState,
};
pub use feature_flag::FeatureFlag;
pub use plan::{Plan, PlanLimits, QuotaDecision, UsageCounterKind, UsageSnapshot};
pub use prompt::{compute_signature, PromptCustomization, PromptSource, ResolvedPrompt};
pub use recording::{Recording, RecordingState};
pub use task::{EnrichmentTask, TaskKind, TaskState};
pub use tenant::{NewTenant, PbxProfile, PbxSystem, Tenant, TenantStatus};
