//! Services for callwise-ingest

pub mod alerting;
pub mod cdr_normalizer;
pub mod enrichment_engine;
pub mod enrichment_orchestrator;
pub mod feature_flags;
pub mod pbx_client;
pub mod prompt_resolver;
pub mod quota_enforcer;
pub mod recording_retriever;
pub mod tenant_registry;
pub mod webhook_gateway;
pub mod work_queue;

pub use alerting::AlertingService;
pub use enrichment_engine::{AudioInput, EnrichmentEngine, HttpEnrichmentEngine, Transcript};
pub use enrichment_orchestrator::{EnrichmentOrchestrator, OrchestratorServices, TaskOutcome};
pub use feature_flags::FeatureFlagService;
pub use pbx_client::{DownloadedRecording, HttpPbxClient, PbxClient};
pub use prompt_resolver::PromptService;
pub use quota_enforcer::QuotaEnforcer;
pub use recording_retriever::RecordingRetriever;
pub use tenant_registry::TenantRegistry;
pub use webhook_gateway::{IngestReceipt, WebhookGateway};
pub use work_queue::{EnrichmentWorker, WorkQueue};
