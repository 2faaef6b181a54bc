//! SENTIMENT, QUALITY, COMPLIANCE and SUMMARY stages
//!
//! All four share one flow: feature flag, API-call quota, prompt, engine
//! call, reply parsing. An unparseable reply is a permanent failure.

use callwise_common::{Error, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::EnrichmentOrchestrator;
use crate::db;
use crate::error::PipelineError;
use crate::models::{
    CallRecord, ComplianceFinding, Plan, SentimentLabel, Severity, Stage,
    StageOutput, StageState, Tenant, UsageCounterKind,
};
use crate::services::enrichment_engine::permanent;
use crate::utils::retry_with_backoff;

impl EnrichmentOrchestrator {
    pub(super) async fn run_analysis(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        plan: &Plan,
        stage: Stage,
        transcript: &str,
    ) -> Result<StageState> {
        let current = self.stage_state(call.id, stage).await?;
        if current.is_terminal() {
            return Ok(current);
        }

        if !self.flags.is_enabled(tenant, &stage.flag_key()).await? {
            self.complete(
                call,
                stage,
                StageState::SkippedDisabled,
                0,
                Some(format!("feature flag {} disabled", stage.flag_key())),
                None,
                None,
            )
            .await?;
            return self.stage_state(call.id, stage).await;
        }

        if !db::stages::try_mark_running(&self.db, call.id, stage).await? {
            return self.stage_state(call.id, stage).await;
        }
        self.emit_stage(call, stage, StageState::Running);

        let result = self.run_claimed_analysis(call, tenant, plan, stage, transcript).await;
        self.release_on_error(call, stage, result).await
    }

    /// Body of a downstream stage that this task holds as `running`
    async fn run_claimed_analysis(
        &self,
        call: &CallRecord,
        tenant: &Tenant,
        plan: &Plan,
        stage: Stage,
        transcript: &str,
    ) -> Result<StageState> {
        let decision = self
            .quota
            .try_consume(tenant, plan, UsageCounterKind::ApiCalls, 1, Utc::now())
            .await?;
        if let Some(denied) = PipelineError::from_quota(decision, UsageCounterKind::ApiCalls, 1) {
            self.complete(call, stage, StageState::SkippedQuota, 0, Some(denied.to_string()), None, None)
                .await?;
            return Ok(StageState::SkippedQuota);
        }

        let prompt = self.prompts.resolve(tenant.id, stage).await?;

        let engine = &self.engine;
        let permits = &self.ai_permits;
        let prompt_ref = &prompt;
        let operation = format!("{} {}", stage, call.id);
        let outcome = retry_with_backoff(&self.stage_policy, &operation, |_attempt| async move {
            let reply = {
                let _permit = permits.acquire().await.map_err(|e| {
                    PipelineError::Common(Error::Internal(format!("AI semaphore closed: {}", e)))
                })?;
                engine.analyze(stage, transcript, prompt_ref).await?
            };
            parse_analysis(stage, &reply)
        })
        .await;

        match outcome.result {
            Ok((output, findings)) => {
                if stage == Stage::Compliance {
                    db::stages::replace_compliance_alerts(&self.db, call.id, &findings, &prompt.identity())
                        .await?;
                }
                info!(
                    call_id = %call.id,
                    stage = %stage,
                    attempts = outcome.attempts,
                    prompt = %prompt.identity(),
                    "Stage succeeded"
                );
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
}

#[derive(Debug, Deserialize)]
struct SentimentReply {
    label: String,
    #[serde(default)]
    score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QualityReply {
    score: f64,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct ComplianceReply {
    #[serde(default, alias = "findings")]
    alerts: Vec<FindingReply>,
}

#[derive(Debug, Deserialize)]
struct FindingReply {
    rule: String,
    severity: String,
    #[serde(default)]
    excerpt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryReply {
    #[serde(alias = "text")]
    summary: String,
}

fn parse_label(stage: Stage, raw: &str) -> std::result::Result<SentimentLabel, PipelineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "positive" => Ok(SentimentLabel::Positive),
        "neutral" => Ok(SentimentLabel::Neutral),
        "negative" => Ok(SentimentLabel::Negative),
        "mixed" => Ok(SentimentLabel::Mixed),
        other => Err(permanent(stage, format!("unknown sentiment label '{}'", other))),
    }
}

/// Turn an engine reply into a stage output (plus compliance findings)
pub fn parse_analysis(
    stage: Stage,
    reply: &Value,
) -> std::result::Result<(StageOutput, Vec<ComplianceFinding>), PipelineError> {
    let invalid = |e: serde_json::Error| permanent(stage, format!("unparseable {} reply: {}", stage, e));

    match stage {
        Stage::Sentiment => {
            let parsed: SentimentReply = serde_json::from_value(reply.clone()).map_err(invalid)?;
            let score = parsed.score.unwrap_or(0.0);
            if !(-1.0..=1.0).contains(&score) {
                return Err(permanent(stage, format!("sentiment score {} outside [-1, 1]", score)));
            }
            Ok((
                StageOutput::Sentiment {
                    label: parse_label(stage, &parsed.label)?,
                    score,
                },
                Vec::new(),
            ))
        }
        Stage::Quality => {
            let parsed: QualityReply = serde_json::from_value(reply.clone()).map_err(invalid)?;
            if !(0.0..=100.0).contains(&parsed.score) {
                return Err(permanent(stage, format!("quality score {} outside [0, 100]", parsed.score)));
            }
            Ok((
                StageOutput::Quality {
                    score: parsed.score.round() as u8,
                    rationale: parsed.rationale,
                },
                Vec::new(),
            ))
        }
        Stage::Compliance => {
            let parsed: ComplianceReply = serde_json::from_value(reply.clone()).map_err(invalid)?;
            let findings = parsed
                .alerts
                .into_iter()
                .map(|f| {
                    let severity = Severity::parse(&f.severity).ok_or_else(|| {
                        permanent(stage, format!("unknown severity '{}'", f.severity))
                    })?;
                    Ok(ComplianceFinding {
                        rule: f.rule,
                        severity,
                        excerpt: f.excerpt,
                    })
                })
                .collect::<std::result::Result<Vec<_>, PipelineError>>()?;
            Ok((
                StageOutput::Compliance {
                    alert_count: findings.len(),
                },
                findings,
            ))
        }
        Stage::Summary => {
            let parsed: SummaryReply = serde_json::from_value(reply.clone()).map_err(invalid)?;
            if parsed.summary.trim().is_empty() {
                return Err(permanent(stage, "empty summary"));
            }
            Ok((StageOutput::Summary { text: parsed.summary }, Vec::new()))
        }
        Stage::Transcription => Err(permanent(stage, "transcription is not an analysis stage")),
    }
}
