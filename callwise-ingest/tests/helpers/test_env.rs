//! Isolated service instance per test
//!
//! Each TestEnv owns a temporary root folder with its own database, a
//! scripted AI engine and a mock PBX. Retry backoff is shortened to a few
//! milliseconds so retry paths run quickly.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use callwise_common::db::init_database;
use callwise_ingest::config::ServiceConfig;
use callwise_ingest::models::{NewTenant, PbxProfile, PbxSystem, Plan, PlanLimits, Tenant};
use callwise_ingest::services::EnrichmentWorker;
use callwise_ingest::{build_router, build_services, db, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;

use super::mocks::{MockPbx, ScriptedEngine};

pub const PBX_USERNAME: &str = "pbx";
pub const WEBHOOK_SECRET: &str = "s3cret";

/// `Authorization` header value for HTTP Basic credentials
pub fn basic_auth(username: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, secret)))
}

/// FreePBX CDR body shaped like a real call-end webhook
pub fn freepbx_cdr(uniqueid: &str, disposition: &str, billsec: i64) -> Value {
    json!({
        "uniqueid": uniqueid,
        "src": "5551234",
        "dst": "200",
        "calldate": "2026-03-02 14:30:00",
        "duration": (billsec + 15).to_string(),
        "billsec": billsec.to_string(),
        "disposition": disposition,
        "recordingfile": format!("/rec/{}.wav", uniqueid),
    })
}

pub struct TestEnv {
    /// Kept alive for the duration of the test
    pub dir: TempDir,
    pub db: SqlitePool,
    pub config: ServiceConfig,
    pub state: AppState,
    pub worker: EnrichmentWorker,
    pub engine: Arc<ScriptedEngine>,
    pub pbx: Arc<MockPbx>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build an environment after adjusting the default configuration
    pub async fn with_config(adjust: impl FnOnce(&mut ServiceConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = ServiceConfig::with_root(dir.path().to_path_buf());
        for policy in [&mut config.toml.retry.recording, &mut config.toml.retry.stage] {
            policy.max_attempts = 3;
            policy.initial_backoff_ms = 1;
            policy.max_backoff_ms = 2;
        }
        adjust(&mut config);
        config.root.ensure_directories().unwrap();

        let db = init_database(&config.root.database_path()).await.unwrap();
        let engine = Arc::new(ScriptedEngine::new());
        let pbx = Arc::new(MockPbx::new());
        let services = build_services(db.clone(), &config, engine.clone(), pbx.clone());

        Self {
            dir,
            db,
            config,
            state: services.state,
            worker: services.worker,
            engine,
            pbx,
        }
    }

    pub fn app(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn seed_tenant(&self, routing_key: &str, system: PbxSystem, plan_id: &str) -> Tenant {
        self.state
            .tenants
            .provision(NewTenant {
                routing_key: routing_key.to_string(),
                display_name: format!("{} Corp", routing_key),
                webhook_username: PBX_USERNAME.to_string(),
                webhook_secret: Some(WEBHOOK_SECRET.to_string()),
                pbx: PbxProfile {
                    system,
                    base_url: "https://pbx.example.test".to_string(),
                    username: "recordings".to_string(),
                    secret: "pbx-pass".to_string(),
                },
                plan_id: plan_id.to_string(),
            })
            .await
            .unwrap()
    }

    /// Insert (or replace) a plan with explicit limits
    pub async fn seed_plan(&self, plan_id: &str, limits: PlanLimits) {
        db::plans::upsert_plan(
            &self.db,
            &Plan {
                id: plan_id.to_string(),
                name: plan_id.to_string(),
                limits,
            },
        )
        .await
        .unwrap();
    }

    /// POST a CDR with the seeded tenant credentials
    pub async fn post_cdr(&self, routing_key: &str, body: &Value) -> (StatusCode, Value) {
        self.post_cdr_raw(
            routing_key,
            Some(basic_auth(PBX_USERNAME, WEBHOOK_SECRET)),
            body.to_string().into_bytes(),
        )
        .await
    }

    pub async fn post_cdr_raw(
        &self,
        routing_key: &str,
        authorization: Option<String>,
        body: Vec<u8>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("/webhook/cdr/{}", routing_key))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }
        self.send(request.body(Body::from(body)).unwrap()).await
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send_json(Method::POST, uri, body).await
    }

    pub async fn send_put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send_json(Method::PUT, uri, body).await
    }

    pub async fn delete(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn send_json(&self, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    /// Drain the work queue the way the background worker would
    pub async fn run_worker(&self) -> usize {
        self.worker.process_pending().await.unwrap()
    }

    /// Stage states of a call keyed by stage name
    pub async fn stage_states(&self, call_id: &str) -> serde_json::Map<String, Value> {
        let (status, body) = self.get_json(&format!("/calls/{}", call_id)).await;
        assert_eq!(status, StatusCode::OK, "call detail: {}", body);
        body["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| (s["stage"].as_str().unwrap().to_string(), s["state"].clone()))
            .collect()
    }

    pub async fn usage(&self, tenant: &Tenant) -> Value {
        let (status, body) = self.get_json(&format!("/tenants/{}/usage", tenant.id)).await;
        assert_eq!(status, StatusCode::OK, "usage: {}", body);
        body
    }
}
