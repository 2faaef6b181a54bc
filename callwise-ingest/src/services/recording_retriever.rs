//! Recording retriever
//!
//! Fetches call audio from the tenant's PBX and stores it under
//! `<root>/recordings/<tenant_id>/<call_id>.<ext>`. A recording in a terminal
//! state is never fetched again.

use callwise_common::events::{CallwiseEvent, EventBus};
use callwise_common::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::PipelineError;
use crate::models::{AlertKind, CallRecord, Recording, RecordingState, Tenant, UsageCounterKind};
use crate::services::alerting::AlertingService;
use crate::services::pbx_client::PbxClient;
use crate::services::quota_enforcer::QuotaEnforcer;
use crate::utils::{retry_with_backoff, RetryPolicy};

const DEFAULT_EXTENSION: &str = "wav";

#[derive(Clone)]
pub struct RecordingRetriever {
    pool: SqlitePool,
    client: Arc<dyn PbxClient>,
    recordings_dir: PathBuf,
    policy: RetryPolicy,
    downloads_per_tenant: usize,
    tenant_permits: Arc<Mutex<HashMap<Uuid, Arc<Semaphore>>>>,
    quota: QuotaEnforcer,
    alerting: AlertingService,
    event_bus: EventBus,
}

impl RecordingRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        client: Arc<dyn PbxClient>,
        recordings_dir: PathBuf,
        policy: RetryPolicy,
        downloads_per_tenant: usize,
        quota: QuotaEnforcer,
        alerting: AlertingService,
        event_bus: EventBus,
    ) -> Self {
        Self {
            pool,
            client,
            recordings_dir,
            policy,
            downloads_per_tenant: downloads_per_tenant.max(1),
            tenant_permits: Arc::new(Mutex::new(HashMap::new())),
            quota,
            alerting,
            event_bus,
        }
    }

    async fn permits_for(&self, tenant_id: Uuid) -> Arc<Semaphore> {
        let mut permits = self.tenant_permits.lock().await;
        permits
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.downloads_per_tenant)))
            .clone()
    }

    /// Return the stored recording, fetching it first if still pending
    ///
    /// Fetch failures are recorded on the recording row and returned as its
    /// state; `Err` is reserved for storage problems.
    pub async fn retrieve(&self, call: &CallRecord, tenant: &Tenant) -> Result<Recording> {
        db::recordings::ensure_recording(&self.pool, call.id, tenant.id).await?;

        let existing = self.load(call.id).await?;
        if existing.state.is_terminal() {
            debug!(call_id = %call.id, state = existing.state.as_str(), "Recording already resolved");
            return Ok(existing);
        }

        let Some(reference) = call.recording_ref.as_deref().filter(|r| !r.trim().is_empty()) else {
            info!(call_id = %call.id, "CDR carries no recording reference");
            db::recordings::mark_terminal_failure(
                &self.pool,
                call.id,
                RecordingState::Unavailable,
                0,
                "no recording reference",
            )
            .await?;
            self.emit_finished(call, RecordingState::Unavailable);
            return self.load(call.id).await;
        };

        let permits = self.permits_for(tenant.id).await;
        let _permit = permits
            .acquire_owned()
            .await
            .map_err(|e| callwise_common::Error::Internal(format!("Download semaphore closed: {}", e)))?;

        let operation = format!("recording download {}", call.id);
        let outcome = retry_with_backoff(&self.policy, &operation, |attempt| {
            debug!(call_id = %call.id, tenant_id = %tenant.id, attempt, "Downloading recording");
            self.client.download(&tenant.pbx, reference)
        })
        .await;

        match outcome.result {
            Ok(downloaded) => {
                let path = self.recording_path(
                    tenant.id,
                    call.id,
                    extension_for(downloaded.content_type.as_deref(), reference),
                );
                write_file(&path, &downloaded.bytes).await?;

                let size = downloaded.bytes.len() as i64;
                let now = Utc::now();
                db::recordings::mark_fetched(
                    &self.pool,
                    call.id,
                    &path.to_string_lossy(),
                    size,
                    downloaded.content_type.as_deref(),
                    outcome.attempts,
                    now,
                )
                .await?;
                self.quota
                    .record(tenant.id, UsageCounterKind::StorageBytes, size, now)
                    .await?;

                info!(
                    call_id = %call.id,
                    tenant_id = %tenant.id,
                    size_bytes = size,
                    attempts = outcome.attempts,
                    "Recording fetched"
                );
                self.emit_finished(call, RecordingState::Fetched);
            }
            Err(PipelineError::Common(e)) => return Err(e),
            Err(err) => {
                let state = match err {
                    PipelineError::RecordingUnavailable(_) => RecordingState::Unavailable,
                    _ => RecordingState::Failed,
                };
                let reason = err.to_string();
                warn!(
                    call_id = %call.id,
                    tenant_id = %tenant.id,
                    state = state.as_str(),
                    attempts = outcome.attempts,
                    error = %reason,
                    "Recording fetch ended without audio"
                );
                db::recordings::mark_terminal_failure(&self.pool, call.id, state, outcome.attempts, &reason)
                    .await?;
                self.alerting
                    .report(
                        Some(tenant.id),
                        AlertKind::RecordingFetchFailure,
                        format!("call {} ({}): {}", call.id, call.uniqueid, reason),
                    )
                    .await;
                self.emit_finished(call, state);
            }
        }

        self.load(call.id).await
    }

    fn recording_path(&self, tenant_id: Uuid, call_id: Uuid, extension: &str) -> PathBuf {
        self.recordings_dir
            .join(tenant_id.to_string())
            .join(format!("{}.{}", call_id, extension))
    }

    async fn load(&self, call_id: Uuid) -> Result<Recording> {
        db::recordings::load_recording(&self.pool, call_id)
            .await?
            .ok_or_else(|| callwise_common::Error::NotFound(format!("Recording for call {}", call_id)))
    }

    fn emit_finished(&self, call: &CallRecord, state: RecordingState) {
        self.event_bus.emit_lossy(CallwiseEvent::RecordingFetchFinished {
            tenant_id: call.tenant_id,
            call_id: call.id,
            state: state.as_str().to_string(),
            timestamp: Utc::now(),
        });
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// File extension from the response content type, else from the reference
fn extension_for<'a>(content_type: Option<&str>, reference: &'a str) -> &'a str {
    let from_type = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match from_type.as_deref() {
        Some("audio/wav") | Some("audio/x-wav") | Some("audio/wave") => return "wav",
        Some("audio/mpeg") | Some("audio/mp3") => return "mp3",
        Some("audio/ogg") => return "ogg",
        Some("audio/gsm") => return "gsm",
        _ => {}
    }

    let path_part = reference.split(['?', '#']).next().unwrap_or(reference);
    match path_part.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && (1..=4).contains(&ext.len())
                && ext.starts_with(|c: char| c.is_ascii_alphabetic())
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext
        }
        _ => DEFAULT_EXTENSION,
    }
}
