//! Enrichment orchestrator
//!
//! Runs one claimed task to an outcome. Stage order is fixed:
//!
//! TRANSCRIPTION → { SENTIMENT | QUALITY | COMPLIANCE | SUMMARY }
//!
//! Per (call, stage) state machine:
//! `pending → running → succeeded | failed | skipped_quota | skipped_dependency | skipped_disabled`
//!
//! Terminal stages are never re-run by a resumed task; only a manual
//! reprocess (which resets the stage to pending) re-runs one.
//!
//! - Transcription lives in `stage_transcription`
//! - The four downstream stages live in `stage_analysis`

use callwise_common::events::{CallwiseEvent, EventBus};
use callwise_common::Result;
use chrono::Utc;
use futures::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::db::stages::StageCompletion;
use crate::error::PipelineError;
use crate::models::{
    CallRecord, EnrichmentTask, Plan, RecordingState, Stage, StageState, TaskKind,
    Tenant, UsageCounterKind,
};
use crate::services::alerting::AlertingService;
use crate::services::enrichment_engine::EnrichmentEngine;
use crate::services::feature_flags::FeatureFlagService;
use crate::services::prompt_resolver::PromptService;
use crate::services::quota_enforcer::QuotaEnforcer;
use crate::services::recording_retriever::RecordingRetriever;
use crate::services::tenant_registry::TenantRegistry;
use crate::utils::RetryPolicy;

mod stage_analysis;
mod stage_transcription;

pub use stage_analysis::parse_analysis;

/// What the dispatcher should do with a task after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Nothing left to do for this task
    Completed,
    /// Return to the queue until the tenant is active again
    Deferred(String),
    /// Another task holds a stage; retry after a delay
    Busy(String),
}

/// Collaborators of the orchestrator
pub struct OrchestratorServices {
    pub tenants: TenantRegistry,
    pub retriever: RecordingRetriever,
    pub engine: Arc<dyn EnrichmentEngine>,
    pub prompts: PromptService,
    pub quota: QuotaEnforcer,
    pub flags: FeatureFlagService,
    pub alerting: AlertingService,
    pub event_bus: EventBus,
}

pub struct EnrichmentOrchestrator {
    db: SqlitePool,
    tenants: TenantRegistry,
    retriever: RecordingRetriever,
    engine: Arc<dyn EnrichmentEngine>,
    prompts: PromptService,
    quota: QuotaEnforcer,
    flags: FeatureFlagService,
    alerting: AlertingService,
    event_bus: EventBus,
    /// Global cap on simultaneous AI calls
    ai_permits: Arc<Semaphore>,
    stage_policy: RetryPolicy,
}

impl EnrichmentOrchestrator {
    pub fn new(
        db: SqlitePool,
        services: OrchestratorServices,
        ai_max_in_flight: usize,
        stage_policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            tenants: services.tenants,
            retriever: services.retriever,
            engine: services.engine,
            prompts: services.prompts,
            quota: services.quota,
            flags: services.flags,
            alerting: services.alerting,
            event_bus: services.event_bus,
            ai_permits: Arc::new(Semaphore::new(ai_max_in_flight.max(1))),
            stage_policy,
        }
    }

    pub async fn run_task(&self, task: &EnrichmentTask) -> Result<TaskOutcome> {
        let Some(call) = db::calls::load_call(&self.db, task.call_id).await? else {
            warn!(task_id = task.id, call_id = %task.call_id, "Task references a missing call, dropping");
            return Ok(TaskOutcome::Completed);
        };
        let Some(tenant) = self.tenants.get(task.tenant_id).await? else {
            warn!(task_id = task.id, tenant_id = %task.tenant_id, "Task references a missing tenant, dropping");
            return Ok(TaskOutcome::Completed);
        };
        if !tenant.is_active() {
            return Ok(TaskOutcome::Deferred("tenant suspended".to_string()));
        }

        info!(
            task_id = task.id,
            call_id = %call.id,
            tenant_id = %tenant.id,
            kind = %task.kind.to_db(),
            "Running enrichment task"
        );

        db::stages::init_stage_rows(&self.db, call.id).await?;
        let plan = self.quota.plan_for(&tenant).await?;

        let outcome = match task.kind {
            TaskKind::Pipeline => self.run_pipeline(&call, &tenant, &plan).await?,
            TaskKind::Reprocess(stage) => self.run_reprocess(&call, &tenant, &plan, stage).await?,
        };

        if outcome == TaskOutcome::Completed {
            self.emit_finished_if_terminal(&call).await?;
        }
        Ok(outcome)
    }

    async fn run_pipeline(&self, call: &CallRecord, tenant: &Tenant, plan: &Plan) -> Result<TaskOutcome> {
        let transcription = self.stage_state(call.id, Stage::Transcription).await?;

        if !transcription.is_terminal() {
            if let Some(outcome) = self.prepare_and_transcribe(call, tenant, plan).await? {
                return Ok(outcome);
            }
        }

        self.run_downstream(call, tenant, plan, &Stage::DOWNSTREAM).await
    }

    async fn run_reprocess(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        plan: &Plan,
        stage: Stage,
    ) -> Result<TaskOutcome> {
        match stage {
            Stage::Transcription => {
                if self.stage_state(call.id, stage).await?.is_terminal() {
                    return Ok(TaskOutcome::Completed);
                }
                Ok(self
                    .prepare_and_transcribe(call, tenant, plan)
                    .await?
                    .unwrap_or(TaskOutcome::Completed))
            }
            downstream => self.run_downstream(call, tenant, plan, &[downstream]).await,
        }
    }

    /// Quota reservations, recording fetch, then transcription
    ///
    /// Both reservations are taken before the recording is stored, so a call
    /// skipped for quota leaves every usage counter as it was.
    /// Returns `Some(outcome)` when the task should stop here.
    async fn prepare_and_transcribe(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        plan: &Plan,
    ) -> Result<Option<TaskOutcome>> {
        // A call is charged once; a resumed or reprocessed call keeps its charge
        if !call.usage_charged {
            let decision = self
                .quota
                .try_consume(tenant, plan, UsageCounterKind::CallsProcessed, 1, Utc::now())
                .await?;
            if let Some(denied) = PipelineError::from_quota(decision, UsageCounterKind::CallsProcessed, 1) {
                self.skip_for_quota(call, &denied.to_string()).await?;
                return Ok(Some(TaskOutcome::Completed));
            }
            db::calls::set_usage_charged(&self.db, call.id, true).await?;
        }

        let minutes = if call.minutes_charged > 0 {
            call.minutes_charged
        } else {
            let minutes = call.billable_minutes();
            let decision = self
                .quota
                .try_consume(tenant, plan, UsageCounterKind::TranscriptionMinutes, minutes, Utc::now())
                .await?;
            if let Some(denied) =
                PipelineError::from_quota(decision, UsageCounterKind::TranscriptionMinutes, minutes)
            {
                self.release_call_charge(call).await?;
                self.skip_for_quota(call, &denied.to_string()).await?;
                return Ok(Some(TaskOutcome::Completed));
            }
            db::calls::swap_minutes_charged(&self.db, call.id, 0, minutes).await?;
            minutes
        };

        let recording = self.retriever.retrieve(call, tenant).await?;
        if recording.state != RecordingState::Fetched {
            self.release_minutes(call, minutes).await?;
            self.release_call_charge(call).await?;
            let reason = format!(
                "recording {}: {}",
                recording.state.as_str(),
                recording.last_error.as_deref().unwrap_or("no detail")
            );
            self.skip(call, &[Stage::Transcription], StageState::SkippedDependency, &reason)
                .await?;
            self.skip_downstream(call, &reason).await?;
            return Ok(Some(TaskOutcome::Completed));
        }

        if let Some(deferred) = self.check_suspended(tenant.id).await? {
            return Ok(Some(deferred));
        }

        match self
            .run_transcription(call, tenant, &recording, minutes)
            .await?
        {
            StageState::Pending | StageState::Running => Ok(Some(TaskOutcome::Busy(
                "transcription in progress elsewhere".to_string(),
            ))),
            _ => Ok(None),
        }
    }

    /// Run the given downstream stages concurrently once transcription succeeded
    async fn run_downstream(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        plan: &Plan,
        stages: &[Stage],
    ) -> Result<TaskOutcome> {
        let transcription = db::stages::load_stage_result(&self.db, call.id, Stage::Transcription).await?;
        let transcript = transcription
            .as_ref()
            .filter(|r| r.state == StageState::Succeeded)
            .and_then(|r| r.output.as_ref())
            .and_then(|o| o.transcript())
            .map(str::to_string);

        let Some(transcript) = transcript else {
            let reason = match transcription.map(|r| r.state) {
                Some(state) if !state.is_terminal() => {
                    return Ok(TaskOutcome::Busy("transcription not finished".to_string()));
                }
                Some(state) => format!("transcription {}", state),
                None => "transcription missing".to_string(),
            };
            self.skip(call, stages, StageState::SkippedDependency, &reason).await?;
            return Ok(TaskOutcome::Completed);
        };

        let mut pending = Vec::new();
        for stage in stages {
            if !self.stage_state(call.id, *stage).await?.is_terminal() {
                pending.push(*stage);
            }
        }
        if pending.is_empty() {
            return Ok(TaskOutcome::Completed);
        }

        if let Some(deferred) = self.check_suspended(tenant.id).await? {
            return Ok(deferred);
        }

        let results = join_all(
            pending
                .iter()
                .map(|stage| self.run_analysis(call, tenant, plan, *stage, &transcript)),
        )
        .await;

        let mut busy = false;
        for result in results {
            if !result?.is_terminal() {
                busy = true;
            }
        }
        if busy {
            return Ok(TaskOutcome::Busy("stage in progress elsewhere".to_string()));
        }
        Ok(TaskOutcome::Completed)
    }

    async fn check_suspended(&self, tenant_id: Uuid) -> Result<Option<TaskOutcome>> {
        let active = self
            .tenants
            .get(tenant_id)
            .await?
            .is_some_and(|t| t.is_active());
        Ok((!active).then(|| TaskOutcome::Deferred("tenant suspended".to_string())))
    }

    /// Give back the calls-processed unit when no AI capacity was used
    async fn release_call_charge(&self, call: &CallRecord) -> Result<()> {
        if db::calls::set_usage_charged(&self.db, call.id, false).await? {
            self.quota
                .release(call.tenant_id, UsageCounterKind::CallsProcessed, 1, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn release_minutes(&self, call: &CallRecord, minutes: i64) -> Result<()> {
        if db::calls::swap_minutes_charged(&self.db, call.id, minutes, 0).await? {
            self.quota
                .release(call.tenant_id, UsageCounterKind::TranscriptionMinutes, minutes, Utc::now())
                .await?;
        }
        Ok(())
    }

    async fn skip_for_quota(&self, call: &CallRecord, reason: &str) -> Result<()> {
        self.skip(call, &[Stage::Transcription], StageState::SkippedQuota, reason)
            .await?;
        self.skip_downstream(call, "transcription skipped: quota").await
    }

    async fn stage_state(&self, call_id: Uuid, stage: Stage) -> Result<StageState> {
        Ok(db::stages::load_stage_result(&self.db, call_id, stage)
            .await?
            .map(|r| r.state)
            .unwrap_or(StageState::Pending))
    }

    async fn skip_downstream(&self, call: &CallRecord, reason: &str) -> Result<()> {
        self.skip(call, &Stage::DOWNSTREAM, StageState::SkippedDependency, reason)
            .await
    }

    /// Move non-terminal stages straight to a skipped state
    async fn skip(&self, call: &CallRecord, stages: &[Stage], state: StageState, reason: &str) -> Result<()> {
        for stage in stages {
            let changed = db::stages::finish_stage(
                &self.db,
                call.id,
                *stage,
                StageCompletion {
                    state,
                    attempts: 0,
                    error: Some(reason.to_string()),
                    prompt: None,
                    output: None,
                },
            )
            .await?;
            if changed {
                info!(call_id = %call.id, stage = %stage, state = %state, reason, "Stage skipped");
                self.emit_stage(call, *stage, state);
            }
        }
        Ok(())
    }

    fn emit_stage(&self, call: &CallRecord, stage: Stage, state: StageState) {
        self.event_bus.emit_lossy(CallwiseEvent::StageStateChanged {
            tenant_id: call.tenant_id,
            call_id: call.id,
            stage: stage.as_str().to_string(),
            state: state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn emit_finished_if_terminal(&self, call: &CallRecord) -> Result<()> {
        let results = db::stages::load_stage_results(&self.db, call.id).await?;
        if results.is_empty() || results.iter().any(|r| !r.state.is_terminal()) {
            return Ok(());
        }

        let succeeded = results.iter().filter(|r| r.state == StageState::Succeeded).count();
        let failed = results.iter().filter(|r| r.state == StageState::Failed).count();
        let skipped = results.iter().filter(|r| r.state.is_skipped()).count();

        info!(call_id = %call.id, succeeded, failed, skipped, "Call enrichment finished");
        self.event_bus.emit_lossy(CallwiseEvent::CallEnrichmentFinished {
            tenant_id: call.tenant_id,
            call_id: call.id,
            succeeded,
            failed,
            skipped,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
