//! Webhook gateway
//!
//! Authenticates a CDR delivery, normalizes it through the tenant's PBX
//! adapter, upserts it and enqueues enrichment when the call became final.
//! No enrichment work happens on the request path.

use callwise_common::events::{CallwiseEvent, EventBus};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::PipelineError;
use crate::models::{AlertKind, Tenant};
use crate::services::alerting::AlertingService;
use crate::services::cdr_normalizer;
use crate::services::tenant_registry::TenantRegistry;
use crate::services::work_queue::WorkQueue;

/// Body of a 200 answer to the PBX
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub status: &'static str,
    pub call_id: Uuid,
    pub created: bool,
    pub enrichment_scheduled: bool,
}

#[derive(Clone)]
pub struct WebhookGateway {
    pool: SqlitePool,
    tenants: TenantRegistry,
    queue: WorkQueue,
    alerting: AlertingService,
    event_bus: EventBus,
    lock_wait_ms: u64,
}

impl WebhookGateway {
    pub fn new(
        pool: SqlitePool,
        tenants: TenantRegistry,
        queue: WorkQueue,
        alerting: AlertingService,
        event_bus: EventBus,
        lock_wait_ms: u64,
    ) -> Self {
        Self {
            pool,
            tenants,
            queue,
            alerting,
            event_bus,
            lock_wait_ms,
        }
    }

    pub async fn ingest(
        &self,
        routing_key: &str,
        authorization: Option<&str>,
        body: &[u8],
    ) -> Result<IngestReceipt, PipelineError> {
        let tenant = self.tenants.authenticate(routing_key, authorization).await?;

        let payload: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                return Err(self
                    .malformed(&tenant, format!("body is not JSON: {}", e))
                    .await)
            }
        };

        let cdr = match cdr_normalizer::normalize(tenant.pbx.system, &payload) {
            Ok(cdr) => cdr,
            Err(PipelineError::MalformedPayload(reason)) => return Err(self.malformed(&tenant, reason).await),
            Err(other) => return Err(other),
        };

        let outcome = db::calls::upsert_call(
            &self.pool,
            self.lock_wait_ms,
            tenant.id,
            tenant.pbx.system,
            &cdr,
            &payload,
        )
        .await?;

        let enrichment_scheduled =
            outcome.schedules_enrichment() && self.queue.enqueue_pipeline(outcome.call_id, tenant.id).await?;

        info!(
            tenant_id = %tenant.id,
            call_id = %outcome.call_id,
            uniqueid = %cdr.uniqueid,
            created = outcome.created,
            disposition = outcome.disposition.map(|d| d.as_str()).unwrap_or("pending"),
            enrichment_scheduled,
            "CDR accepted"
        );

        self.event_bus.emit_lossy(CallwiseEvent::CdrReceived {
            tenant_id: tenant.id,
            call_id: outcome.call_id,
            uniqueid: cdr.uniqueid.clone(),
            created: outcome.created,
            timestamp: Utc::now(),
        });

        Ok(IngestReceipt {
            status: "accepted",
            call_id: outcome.call_id,
            created: outcome.created,
            enrichment_scheduled,
        })
    }

    async fn malformed(&self, tenant: &Tenant, reason: String) -> PipelineError {
        warn!(tenant_id = %tenant.id, reason = %reason, "Rejected malformed CDR payload");
        self.alerting
            .report(
                Some(tenant.id),
                AlertKind::MalformedPayload,
                format!("malformed CDR from {}: {}", tenant.routing_key, reason),
            )
            .await;
        PipelineError::MalformedPayload(reason)
    }
}
