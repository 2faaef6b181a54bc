//! Integration tests for the consumer and admin endpoints
//!
//! Reprocessing, prompt customization, alerts, usage, tenants and health.

mod helpers;

use axum::http::StatusCode;
use callwise_ingest::models::{PbxSystem, Stage};
use helpers::{freepbx_cdr, PbxReply, TestEnv};
use serde_json::{json, Value};

async fn enriched_call(env: &TestEnv, uniqueid: &str) -> String {
    let (_, body) = env.post_cdr("acme", &freepbx_cdr(uniqueid, "ANSWERED", 125)).await;
    env.run_worker().await;
    body["call_id"].as_str().unwrap().to_string()
}

fn stage_field(detail: &Value, name: &str, field: &str) -> Value {
    detail["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["stage"] == name)
        .map(|s| s[field].clone())
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_health_endpoint() {
    let env = TestEnv::new().await;

    let (status, body) = env.get_json("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "callwise-ingest");
    assert_eq!(body["pending_tasks"], 0);
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn test_reprocess_reruns_only_the_requested_stage() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let call_id = enriched_call(&env, "20.1").await;
    let uri = format!("/calls/{}/stages/summary/reprocess", call_id);

    let (status, body) = env.post_json(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(body["status"], "scheduled");
    assert_eq!(body["task_created"], true);

    // Asking again before the worker ran is answered idempotently
    let (status, again) = env.post_json(&uri, json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["task_created"], false);

    assert_eq!(env.run_worker().await, 1);

    let (_, detail) = env.get_json(&format!("/calls/{}", call_id)).await;
    assert_eq!(stage_field(&detail, "summary", "state"), "succeeded");
    assert_eq!(env.engine.calls(Stage::Summary), 2);
    assert_eq!(env.engine.calls(Stage::Sentiment), 1);
    assert_eq!(env.engine.calls(Stage::Transcription), 1);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 1);
    assert_eq!(usage["api_calls"], 5);
}

#[tokio::test]
async fn test_reprocess_transcription_bills_the_new_run() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let call_id = enriched_call(&env, "20.2").await;

    let (status, _) = env
        .post_json(&format!("/calls/{}/stages/transcription/reprocess", call_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    env.run_worker().await;

    assert_eq!(env.engine.calls(Stage::Transcription), 2);
    // The stored recording is reused
    assert_eq!(env.pbx.calls(), 1);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 1);
    assert_eq!(usage["transcription_minutes"], 6);
}

#[tokio::test]
async fn test_reprocess_transcription_refetches_a_failed_recording() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.pbx.push_many(PbxReply::Status(503), 3);
    let call_id = enriched_call(&env, "20.3").await;

    let (_, detail) = env.get_json(&format!("/calls/{}", call_id)).await;
    assert_eq!(detail["recording"]["state"], "failed");
    assert_eq!(stage_field(&detail, "transcription", "state"), "skipped_dependency");
    assert_eq!(env.pbx.calls(), 3);

    let (status, body) = env
        .post_json(&format!("/calls/{}/stages/transcription/reprocess", call_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "body: {}", body);
    assert_eq!(env.run_worker().await, 1);

    let (_, detail) = env.get_json(&format!("/calls/{}", call_id)).await;
    assert_eq!(detail["recording"]["state"], "fetched");
    assert_eq!(stage_field(&detail, "transcription", "state"), "succeeded");
    assert_eq!(env.pbx.calls(), 4);
    assert_eq!(env.engine.calls(Stage::Transcription), 1);
}

#[tokio::test]
async fn test_reprocess_rejects_unknown_and_unfinished_stages() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let (_, body) = env.post_cdr("acme", &freepbx_cdr("21.1", "ANSWERED", 60)).await;
    let call_id = body["call_id"].as_str().unwrap().to_string();

    // Not started yet
    let (status, _) = env
        .post_json(&format!("/calls/{}/stages/summary/reprocess", call_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = env
        .post_json(&format!("/calls/{}/stages/horoscope/reprocess", call_id), json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = env
        .post_json(
            &format!("/calls/{}/stages/summary/reprocess", uuid::Uuid::new_v4()),
            json!({}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prompt_resolution_falls_back_to_default() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (status, body) = env
        .get_json(&format!("/tenants/{}/prompts/summary/resolved", tenant.id))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source"], "default");
    assert!(body["customization_id"].is_null());
    assert!(!body["body"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_prompt_versions_create_restore_and_deactivate() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let base = format!("/tenants/{}/prompts/summary", tenant.id);

    let (status, v1) = env
        .post_json(&base, json!({"body": "Summarize in one sentence.", "author": "dana"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v1["version"], 1);
    assert_eq!(v1["is_active"], true);

    let (_, v2) = env
        .post_json(&base, json!({"body": "Summarize in three bullets.", "author": "dana"}))
        .await;
    assert_eq!(v2["version"], 2);

    let (status, v3) = env
        .post_json(&format!("{}/versions/1/restore", base), json!({"author": "lee"}))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(v3["version"], 3);
    assert_eq!(v3["restored_from"], 1);
    assert_eq!(v3["body"], "Summarize in one sentence.");

    let (_, overview) = env.get_json(&base).await;
    assert_eq!(overview["history"].as_array().unwrap().len(), 3);
    assert_eq!(overview["active"]["version"], 3);
    let active_count = overview["history"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["is_active"] == true)
        .count();
    assert_eq!(active_count, 1);

    let (_, resolved) = env.get_json(&format!("{}/resolved", base)).await;
    assert_eq!(resolved["source"], "tenant");
    assert_eq!(resolved["version"], 3);

    let (status, body) = env.delete(&format!("{}/active", base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deactivated"], true);
    let (_, resolved) = env.get_json(&format!("{}/resolved", base)).await;
    assert_eq!(resolved["source"], "default");

    let (status, _) = env
        .post_json(&format!("{}/versions/9/restore", base), json!({"author": "lee"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_prompt_requests_are_validated() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (empty, _) = env
        .post_json(
            &format!("/tenants/{}/prompts/summary", tenant.id),
            json!({"body": "  ", "author": "dana"}),
        )
        .await;
    let (unknown_feature, _) = env
        .post_json(
            &format!("/tenants/{}/prompts/weather", tenant.id),
            json!({"body": "x", "author": "dana"}),
        )
        .await;
    let (unknown_tenant, _) = env
        .get_json(&format!("/tenants/{}/prompts/summary", uuid::Uuid::new_v4()))
        .await;

    assert_eq!(empty, StatusCode::BAD_REQUEST);
    assert_eq!(unknown_feature, StatusCode::BAD_REQUEST);
    assert_eq!(unknown_tenant, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_results_keep_the_prompt_they_were_produced_with() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let base = format!("/tenants/{}/prompts/summary", tenant.id);
    env.post_json(&base, json!({"body": "Version one.", "author": "dana"}))
        .await;

    let call_id = enriched_call(&env, "22.1").await;
    let v1_identity = format!("tenant:{}/summary@v1", tenant.id);

    env.post_json(&base, json!({"body": "Version two.", "author": "dana"}))
        .await;
    let (_, detail) = env.get_json(&format!("/calls/{}", call_id)).await;
    assert_eq!(stage_field(&detail, "summary", "prompt_identity"), v1_identity.as_str());
    assert_eq!(stage_field(&detail, "summary", "prompt_version"), 1);

    env.post_json(&format!("/calls/{}/stages/summary/reprocess", call_id), json!({}))
        .await;
    env.run_worker().await;

    let v2_identity = format!("tenant:{}/summary@v2", tenant.id);
    let (_, detail) = env.get_json(&format!("/calls/{}", call_id)).await;
    assert_eq!(stage_field(&detail, "summary", "prompt_identity"), v2_identity.as_str());
    assert_eq!(env.engine.prompts_seen(Stage::Summary), vec![v1_identity, v2_identity]);

    // Stages without a customization used the global default
    assert!(stage_field(&detail, "sentiment", "prompt_identity")
        .as_str()
        .unwrap()
        .starts_with("default/sentiment@v"));
}

#[tokio::test]
async fn test_alerts_can_be_acknowledged() {
    let env = TestEnv::with_config(|config| {
        config.toml.alerts.malformed_payload_threshold = 1;
    })
    .await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.post_cdr("acme", &json!({"disposition": "ANSWERED"})).await;

    let (_, list) = env.get_json("/alerts").await;
    let alert_id = list["alerts"][0]["id"].as_i64().unwrap();

    let (status, body) = env.post_json(&format!("/alerts/{}/ack", alert_id), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["acknowledged"], true);

    let (_, open) = env.get_json("/alerts").await;
    assert!(open["alerts"].as_array().unwrap().is_empty());
    let (_, all) = env.get_json("/alerts?include_acknowledged=true").await;
    assert_eq!(all["alerts"].as_array().unwrap().len(), 1);

    let (status, _) = env.post_json(&format!("/alerts/{}/ack", alert_id), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_usage_and_call_listing_are_tenant_scoped() {
    let env = TestEnv::new().await;
    let acme = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let globex = env.seed_tenant("globex", PbxSystem::FreePbx, "starter").await;
    enriched_call(&env, "23.1").await;

    let acme_usage = env.usage(&acme).await;
    assert_eq!(acme_usage["plan_id"], "free");
    assert_eq!(acme_usage["limits"]["transcription_minutes"], 200);
    assert_eq!(acme_usage["calls_processed"], 1);
    assert_eq!(env.usage(&globex).await["calls_processed"], 0);

    let (_, acme_calls) = env.get_json(&format!("/tenants/{}/calls", acme.id)).await;
    let (_, globex_calls) = env.get_json(&format!("/tenants/{}/calls?limit=5", globex.id)).await;
    assert_eq!(acme_calls["calls"].as_array().unwrap().len(), 1);
    assert!(globex_calls["calls"].as_array().unwrap().is_empty());

    let (status, _) = env
        .get_json(&format!("/tenants/{}/usage", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tenant_provisioning_via_admin_api() {
    let env = TestEnv::new().await;
    let request = json!({
        "routing_key": "initech",
        "display_name": "Initech",
        "webhook_username": "pbx",
        "pbx_system": "threecx",
        "pbx_base_url": "https://initech.3cx.example.test",
        "pbx_username": "api",
        "pbx_secret": "hunter2",
        "plan_id": "starter"
    });

    let (status, created) = env.post_json("/tenants", request.clone()).await;
    assert_eq!(status, StatusCode::CREATED, "body: {}", created);
    assert_eq!(created["tenant"]["routing_key"], "initech");
    assert!(created["webhook_secret"].as_str().unwrap().len() >= 16);
    assert!(created["tenant"].get("pbx_secret").is_none());

    let (status, _) = env.post_json("/tenants", request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = env.get_json("/tenants").await;
    assert_eq!(list["tenants"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_rotated_secret_replaces_the_old_one() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (status, rotated) = env
        .post_json(&format!("/tenants/{}/rotate-secret", tenant.id), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let secret = rotated["webhook_secret"].as_str().unwrap().to_string();
    assert_ne!(secret, helpers::WEBHOOK_SECRET);

    let body = freepbx_cdr("30.1", "ANSWERED", 10).to_string().into_bytes();
    let (old, _) = env.post_cdr("acme", &freepbx_cdr("30.1", "ANSWERED", 10)).await;
    let (new, _) = env
        .post_cdr_raw("acme", Some(helpers::basic_auth(helpers::PBX_USERNAME, &secret)), body)
        .await;
    assert_eq!(old, StatusCode::UNAUTHORIZED);
    assert_eq!(new, StatusCode::OK);
}

#[tokio::test]
async fn test_global_flags_can_be_managed() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (status, flag) = env
        .send_put(
            "/flags/stage.quality",
            json!({"enabled": false, "allowed_plans": ["pro"]}),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {}", flag);
    assert_eq!(flag["rollout_percentage"], 100);

    let (status, _) = env
        .send_put("/flags/stage.summary", json!({"enabled": true, "rollout_percentage": 101}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = env.get_json("/flags").await;
    assert_eq!(list["flags"].as_array().unwrap().len(), 1);

    assert!(!env.state.flags.is_enabled(&tenant, "stage.quality").await.unwrap());
    assert!(env.state.flags.is_enabled(&tenant, "stage.summary").await.unwrap());
}
