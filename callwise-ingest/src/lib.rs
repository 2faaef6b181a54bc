//! callwise-ingest library interface
//!
//! Exposes the service assembly and router for the binary and for
//! integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, PipelineError};

use axum::Router;
use callwise_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::services::{
    AlertingService, EnrichmentEngine, EnrichmentOrchestrator, EnrichmentWorker,
    FeatureFlagService, OrchestratorServices, PbxClient, PromptService, QuotaEnforcer,
    RecordingRetriever, TenantRegistry, WebhookGateway, WorkQueue,
};

/// Broadcast buffer for pipeline events
const EVENT_BUS_CAPACITY: usize = 1000;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub event_bus: EventBus,
    pub gateway: WebhookGateway,
    pub tenants: TenantRegistry,
    pub queue: WorkQueue,
    pub prompts: PromptService,
    pub quota: QuotaEnforcer,
    pub flags: FeatureFlagService,
    pub alerting: AlertingService,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

/// Everything `serve` needs: HTTP state plus the background worker
pub struct Services {
    pub state: AppState,
    pub worker: EnrichmentWorker,
}

/// Wire all services over one pool
///
/// The engine and PBX client are injected so tests can script them.
pub fn build_services(
    db: SqlitePool,
    config: &ServiceConfig,
    engine: Arc<dyn EnrichmentEngine>,
    pbx_client: Arc<dyn PbxClient>,
) -> Services {
    let toml = &config.toml;
    let lock_wait_ms = config.lock_wait_ms();
    let event_bus = EventBus::new(EVENT_BUS_CAPACITY);

    let tenants = TenantRegistry::new(db.clone());
    let alerting = AlertingService::new(db.clone(), toml.alerts.clone(), event_bus.clone());
    let quota = QuotaEnforcer::new(db.clone(), alerting.clone(), lock_wait_ms);
    let prompts = PromptService::new(db.clone());
    let flags = FeatureFlagService::new(db.clone());
    let queue = WorkQueue::new(db.clone());

    let retriever = RecordingRetriever::new(
        db.clone(),
        pbx_client,
        config.root.recordings_dir(),
        config.recording_retry(),
        toml.concurrency.pbx_downloads_per_tenant,
        quota.clone(),
        alerting.clone(),
        event_bus.clone(),
    );

    let orchestrator = Arc::new(EnrichmentOrchestrator::new(
        db.clone(),
        OrchestratorServices {
            tenants: tenants.clone(),
            retriever,
            engine,
            prompts: prompts.clone(),
            quota: quota.clone(),
            flags: flags.clone(),
            alerting: alerting.clone(),
            event_bus: event_bus.clone(),
        },
        toml.concurrency.ai_max_in_flight,
        config.stage_retry(),
    ));

    let worker = EnrichmentWorker::new(
        queue.clone(),
        orchestrator,
        toml.concurrency.worker_concurrency,
        config.poll_interval(),
    );

    let gateway = WebhookGateway::new(
        db.clone(),
        tenants.clone(),
        queue.clone(),
        alerting.clone(),
        event_bus.clone(),
        lock_wait_ms,
    );

    Services {
        state: AppState {
            db,
            event_bus,
            gateway,
            tenants,
            queue,
            prompts,
            quota,
            flags,
            alerting,
            startup_time: Utc::now(),
        },
        worker,
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::webhook_routes())
        .merge(api::call_routes())
        .merge(api::prompt_routes())
        .merge(api::usage_routes())
        .merge(api::tenant_routes())
        .merge(api::flag_routes())
        .merge(api::alert_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
