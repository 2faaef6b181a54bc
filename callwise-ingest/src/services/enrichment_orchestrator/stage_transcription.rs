//! TRANSCRIPTION stage

use callwise_common::{Error, Result};
use std::path::PathBuf;
use tracing::{error, info, warn};

use super::EnrichmentOrchestrator;
use crate::db;
use crate::db::stages::StageCompletion;
use crate::error::PipelineError;
use crate::models::{
    AlertKind, CallRecord, Recording, ResolvedPrompt, Stage, StageOutput, StageState, Tenant,
};
use crate::services::enrichment_engine::AudioInput;
use crate::utils::retry_with_backoff;

impl EnrichmentOrchestrator {
    /// Returns the stage state after this attempt; `minutes` are already reserved
    ///
    /// `Pending`/`Running` means another worker holds the stage.
    pub(super) async fn run_transcription(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        recording: &Recording,
        minutes: i64,
    ) -> Result<StageState> {
        let stage = Stage::Transcription;
        if !db::stages::try_mark_running(&self.db, call.id, stage).await? {
            return self.stage_state(call.id, stage).await;
        }
        self.emit_stage(call, stage, StageState::Running);

        let result = self.run_claimed_transcription(call, tenant, recording, minutes).await;
        self.release_on_error(call, stage, result).await
    }

    async fn run_claimed_transcription(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        recording: &Recording,
        minutes: i64,
    ) -> Result<StageState> {
        let stage = Stage::Transcription;
        let prompt = self.prompts.resolve(tenant.id, stage).await?;
        let audio = AudioInput {
            path: PathBuf::from(recording.file_path.as_deref().ok_or_else(|| {
                Error::Internal(format!("Fetched recording for call {} has no path", call.id))
            })?),
            content_type: recording.content_type.clone(),
        };

        let engine = &self.engine;
        let permits = &self.ai_permits;
        let audio_ref = &audio;
        let prompt_ref = &prompt;
        let operation = format!("transcription {}", call.id);
        let outcome = retry_with_backoff(&self.stage_policy, &operation, |_attempt| async move {
            let _permit = permits
                .acquire()
                .await
                .map_err(|e| PipelineError::Common(Error::Internal(format!("AI semaphore closed: {}", e))))?;
            engine.transcribe(audio_ref, prompt_ref).await
        })
        .await;

        match outcome.result {
            Ok(transcript) => {
                info!(
                    call_id = %call.id,
                    stage = %stage,
                    attempts = outcome.attempts,
                    billed_minutes = minutes,
                    prompt = %prompt.identity(),
                    "Transcription succeeded"
                );
                let output = StageOutput::Transcription {
                    text: transcript.text,
                    language: transcript.language,
                    billed_minutes: minutes,
                };
                self.complete(
                    call,
                    stage,
                    StageState::Succeeded,
                    outcome.attempts,
                    None,
                    Some(&prompt),
                    Some(output),
                )
                .await?;
                Ok(StageState::Succeeded)
            }
            Err(PipelineError::Common(e)) => Err(e),
            Err(err) => {
                self.fail_stage(call, stage, outcome.attempts, &prompt, err).await?;
                Ok(StageState::Failed)
            }
        }
    }

    /// Put a stage this task holds back to `pending` when its run errored
    ///
    /// The error still propagates so the task is retried later.
    pub(super) async fn release_on_error(
        &self,
        call: &CallRecord,
        stage: Stage,
        result: Result<StageState>,
    ) -> Result<StageState> {
        let err = match result {
            Ok(state) => return Ok(state),
            Err(err) => err,
        };
        let reason = err.to_string();
        warn!(call_id = %call.id, stage = %stage, error = %reason, "Stage interrupted, returned to pending");
        match db::stages::release_running(&self.db, call.id, stage, &reason).await {
            Ok(true) => self.emit_stage(call, stage, StageState::Pending),
            Ok(false) => {}
            Err(e) => {
                error!(call_id = %call.id, stage = %stage, error = %e, "Failed to release interrupted stage");
            }
        }
        Err(err)
    }

    /// Persist a terminal state and announce it
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn complete(
        &self,
        call: &CallRecord,
        stage: Stage,
        state: StageState,
        attempts: u32,
        error: Option<String>,
        prompt: Option<&ResolvedPrompt>,
        output: Option<StageOutput>,
    ) -> Result<()> {
        let changed = db::stages::finish_stage(
            &self.db,
            call.id,
            stage,
            StageCompletion {
                state,
                attempts,
                error,
                prompt,
                output,
            },
        )
        .await?;
        if changed {
            self.emit_stage(call, stage, state);
        }
        Ok(())
    }

    pub(super) async fn fail_stage(
        &self,
        call: &CallRecord,
        stage: Stage,
        attempts: u32,
        prompt: &ResolvedPrompt,
        err: PipelineError,
    ) -> Result<()> {
        let reason = err.to_string();
        warn!(
            call_id = %call.id,
            tenant_id = %call.tenant_id,
            stage = %stage,
            attempts,
            error = %reason,
            "Stage failed"
        );
        self.complete(call, stage, StageState::Failed, attempts, Some(reason.clone()), Some(prompt), None)
            .await?;
        self.alerting
            .report(
                Some(call.tenant_id),
                AlertKind::StageFailure,
                format!("call {} stage {}: {}", call.id, stage, reason),
            )
            .await;
        Ok(())
    }
}
