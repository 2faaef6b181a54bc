//! HTTP API handlers for callwise-ingest
//!
//! PBX-facing webhook plus the consumer API for enrichment results,
//! prompts, usage and operator alerts, and tenant and flag administration.

pub mod alerts;
pub mod calls;
pub mod flags;
pub mod health;
pub mod prompts;
pub mod sse;
pub mod tenants;
pub mod usage;
pub mod webhook;

pub use alerts::alert_routes;
pub use calls::call_routes;
pub use flags::flag_routes;
pub use health::health_routes;
pub use prompts::prompt_routes;
pub use sse::event_stream;
pub use tenants::tenant_routes;
pub use usage::usage_routes;
pub use webhook::webhook_routes;
