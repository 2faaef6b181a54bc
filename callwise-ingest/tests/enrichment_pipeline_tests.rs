//! End-to-end enrichment tests: webhook → queue → worker → stage results
//!
//! The AI engine and PBX are scripted; everything else is the real stack
//! over a temporary database.

mod helpers;

use callwise_ingest::db;
use callwise_ingest::models::{FeatureFlag, PbxSystem, PlanLimits, Stage, StageState};
use helpers::{freepbx_cdr, EngineReply, PbxReply, TestEnv};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

async fn ingest_and_run(env: &TestEnv, uniqueid: &str, billsec: i64) -> String {
    let (status, body) = env.post_cdr("acme", &freepbx_cdr(uniqueid, "ANSWERED", billsec)).await;
    assert!(status.is_success(), "ingest failed: {}", body);
    env.run_worker().await;
    body["call_id"].as_str().unwrap().to_string()
}

async fn call_detail(env: &TestEnv, call_id: &str) -> Value {
    env.get_json(&format!("/calls/{}", call_id)).await.1
}

fn stage<'a>(detail: &'a Value, name: &str) -> &'a Value {
    detail["stages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["stage"] == name)
        .unwrap_or_else(|| panic!("no stage {} in {}", name, detail))
}

#[tokio::test]
async fn test_answered_call_is_fully_enriched_once() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let call_id = ingest_and_run(&env, "123.1", 125).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(detail["recording"]["state"], "fetched");
    assert_eq!(detail["recording"]["attempts"], 1);
    for name in ["transcription", "sentiment", "quality", "compliance", "summary"] {
        assert_eq!(stage(&detail, name)["state"], "succeeded", "stage {}", name);
    }
    assert_eq!(stage(&detail, "transcription")["output"]["billed_minutes"], 3);
    assert_eq!(stage(&detail, "sentiment")["output"]["label"], "negative");
    assert_eq!(stage(&detail, "quality")["output"]["score"], 72);

    let alerts = detail["compliance_alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["rule"], "refund_promise");
    assert!(alerts[0]["prompt_identity"]
        .as_str()
        .unwrap()
        .starts_with("default/compliance@v"));

    assert_eq!(env.pbx.references(), vec!["/rec/123.1.wav".to_string()]);
    assert_eq!(env.engine.calls(Stage::Transcription), 1);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 1);
    assert_eq!(usage["transcription_minutes"], 3);
    assert_eq!(usage["api_calls"], 4);
    assert!(usage["storage_bytes"].as_i64().unwrap() > 0);

    // Redelivery of the same CDR does not enrich again
    let (_, again) = env.post_cdr("acme", &freepbx_cdr("123.1", "ANSWERED", 125)).await;
    assert_eq!(again["call_id"], call_id.as_str());
    assert_eq!(env.run_worker().await, 0);
    assert_eq!(env.engine.total_calls(), 5);
    assert_eq!(env.pbx.calls(), 1);
}

#[tokio::test]
async fn test_minutes_quota_exhausted_skips_without_charging() {
    let env = TestEnv::new().await;
    env.seed_plan(
        "tiny",
        PlanLimits {
            transcription_minutes: Some(2),
            ..PlanLimits::default()
        },
    )
    .await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "tiny").await;

    let call_id = ingest_and_run(&env, "123.1", 125).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(stage(&detail, "transcription")["state"], "skipped_quota");
    for name in ["sentiment", "quality", "compliance", "summary"] {
        assert_eq!(stage(&detail, name)["state"], "skipped_dependency", "stage {}", name);
    }
    assert_eq!(env.pbx.calls(), 0);
    assert_eq!(env.engine.total_calls(), 0);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 0);
    assert_eq!(usage["transcription_minutes"], 0);
    assert_eq!(usage["storage_bytes"], 0);
    assert_eq!(usage["api_calls"], 0);
}

#[tokio::test]
async fn test_quota_boundary_allows_last_unit_and_denies_the_next() {
    let env = TestEnv::new().await;
    env.seed_plan(
        "three-minutes",
        PlanLimits {
            transcription_minutes: Some(3),
            ..PlanLimits::default()
        },
    )
    .await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "three-minutes").await;

    let first = ingest_and_run(&env, "1.1", 125).await;
    let second = ingest_and_run(&env, "1.2", 10).await;

    let first = call_detail(&env, &first).await;
    let second = call_detail(&env, &second).await;
    assert_eq!(stage(&first, "transcription")["state"], "succeeded");
    assert_eq!(stage(&second, "transcription")["state"], "skipped_quota");

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["transcription_minutes"], 3);
    assert_eq!(usage["calls_processed"], 1);
}

#[tokio::test]
async fn test_calls_quota_exhausted_skips_second_call() {
    let env = TestEnv::new().await;
    env.seed_plan(
        "one-call",
        PlanLimits {
            calls_processed: Some(1),
            ..PlanLimits::default()
        },
    )
    .await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "one-call").await;

    ingest_and_run(&env, "2.1", 30).await;
    let second = ingest_and_run(&env, "2.2", 30).await;

    let detail = call_detail(&env, &second).await;
    assert_eq!(stage(&detail, "transcription")["state"], "skipped_quota");
    assert_eq!(env.usage(&tenant).await["calls_processed"], 1);
    assert_eq!(env.pbx.calls(), 1);
}

#[tokio::test]
async fn test_disabled_flag_skips_only_that_stage() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.state
        .flags
        .set_flag(&FeatureFlag::disabled("stage.summary"))
        .await
        .unwrap();
    let (status, _) = env
        .post_json(
            &format!("/tenants/{}/features", tenant.id),
            json!({"key": "stage.sentiment", "enabled": false}),
        )
        .await;
    assert!(status.is_success());

    let call_id = ingest_and_run(&env, "3.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(stage(&detail, "summary")["state"], "skipped_disabled");
    assert_eq!(stage(&detail, "sentiment")["state"], "skipped_disabled");
    assert_eq!(stage(&detail, "quality")["state"], "succeeded");
    assert_eq!(stage(&detail, "compliance")["state"], "succeeded");
    assert_eq!(env.engine.calls(Stage::Summary), 0);
    assert_eq!(env.usage(&tenant).await["api_calls"], 2);
}

#[tokio::test]
async fn test_missing_recording_is_unavailable_after_one_attempt() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.pbx.push(PbxReply::Status(404));

    let call_id = ingest_and_run(&env, "4.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(detail["recording"]["state"], "unavailable");
    assert_eq!(detail["recording"]["attempts"], 1);
    assert_eq!(stage(&detail, "transcription")["state"], "skipped_dependency");
    assert_eq!(stage(&detail, "summary")["state"], "skipped_dependency");
    assert_eq!(env.pbx.calls(), 1);
    assert_eq!(env.engine.total_calls(), 0);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 0);
    assert_eq!(usage["transcription_minutes"], 0);
}

#[tokio::test]
async fn test_cdr_without_recording_reference_makes_no_pbx_call() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (_, body) = env
        .post_cdr("acme", &json!({"uniqueid": "5.1", "billsec": "40", "disposition": "ANSWERED"}))
        .await;
    env.run_worker().await;

    let detail = call_detail(&env, body["call_id"].as_str().unwrap()).await;
    assert_eq!(detail["recording"]["state"], "unavailable");
    assert_eq!(detail["recording"]["attempts"], 0);
    assert_eq!(env.pbx.calls(), 0);
}

#[tokio::test]
async fn test_transient_pbx_errors_are_retried_then_succeed() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.pbx.push_many(PbxReply::Status(503), 2);

    let call_id = ingest_and_run(&env, "6.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(detail["recording"]["state"], "fetched");
    assert_eq!(detail["recording"]["attempts"], 3);
    assert_eq!(stage(&detail, "transcription")["state"], "succeeded");
}

#[tokio::test]
async fn test_pbx_retries_are_bounded_and_alert() {
    let env = TestEnv::with_config(|config| {
        config.toml.alerts.fetch_failure_threshold = 1;
    })
    .await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.pbx.push_many(PbxReply::Status(503), 10);

    let call_id = ingest_and_run(&env, "6.2", 60).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(detail["recording"]["state"], "failed");
    assert_eq!(detail["recording"]["attempts"], 3);
    assert_eq!(env.pbx.calls(), 3);

    let (_, alerts) = env.get_json("/alerts").await;
    let alerts = alerts["alerts"].as_array().unwrap();
    assert!(alerts.iter().any(|a| a["kind"] == "recording_fetch_failure"));
}

#[tokio::test]
async fn test_transient_engine_errors_are_retried_within_bound() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.engine.push_many(Stage::Transcription, EngineReply::Transient, 2);
    env.engine.push_many(Stage::Sentiment, EngineReply::Transient, 3);

    let call_id = ingest_and_run(&env, "7.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    let transcription = stage(&detail, "transcription");
    assert_eq!(transcription["state"], "succeeded");
    assert_eq!(transcription["attempts"], 3);

    let sentiment = stage(&detail, "sentiment");
    assert_eq!(sentiment["state"], "failed");
    assert_eq!(sentiment["attempts"], 3);
    assert_eq!(env.engine.calls(Stage::Sentiment), 3);

    // One failed analysis does not block its siblings
    assert_eq!(stage(&detail, "quality")["state"], "succeeded");
    assert_eq!(stage(&detail, "summary")["state"], "succeeded");
}

#[tokio::test]
async fn test_permanent_transcription_failure_skips_downstream() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.engine.push(Stage::Transcription, EngineReply::Permanent);

    let call_id = ingest_and_run(&env, "8.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    let transcription = stage(&detail, "transcription");
    assert_eq!(transcription["state"], "failed");
    assert_eq!(transcription["attempts"], 1);
    assert!(transcription["error"].as_str().unwrap().contains("400"));
    for name in ["sentiment", "quality", "compliance", "summary"] {
        assert_eq!(stage(&detail, name)["state"], "skipped_dependency", "stage {}", name);
    }
    assert_eq!(env.engine.total_calls(), 1);

    // The engine was called, so the call and its minutes stay charged
    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 1);
    assert_eq!(usage["transcription_minutes"], 1);
}

#[tokio::test]
async fn test_unparseable_analysis_reply_fails_that_stage() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.engine
        .push(Stage::Quality, EngineReply::Json(json!({"score": 250, "rationale": "x"})));
    env.engine
        .push(Stage::Summary, EngineReply::Json(json!({"summary": "   "})));

    let call_id = ingest_and_run(&env, "9.1", 60).await;

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(stage(&detail, "quality")["state"], "failed");
    assert_eq!(stage(&detail, "quality")["attempts"], 1);
    assert_eq!(stage(&detail, "summary")["state"], "failed");
    assert_eq!(stage(&detail, "sentiment")["state"], "succeeded");
}

#[tokio::test]
async fn test_recovery_resumes_without_rerunning_terminal_stages() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let call_id = ingest_and_run(&env, "10.1", 125).await;

    // Simulate a crash while the sentiment stage was in flight
    sqlx::query("UPDATE enrichment_tasks SET state = 'running'")
        .execute(&env.db)
        .await
        .unwrap();
    sqlx::query("UPDATE stage_results SET state = 'running' WHERE stage = 'sentiment'")
        .execute(&env.db)
        .await
        .unwrap();

    let (tasks, stages) = env.state.queue.recover().await.unwrap();
    assert_eq!((tasks, stages), (1, 1));
    assert_eq!(env.run_worker().await, 1);

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(stage(&detail, "sentiment")["state"], "succeeded");
    assert_eq!(env.engine.calls(Stage::Sentiment), 2);
    assert_eq!(env.engine.calls(Stage::Transcription), 1);
    assert_eq!(env.engine.calls(Stage::Summary), 1);
    assert_eq!(env.pbx.calls(), 1);

    let usage = env.usage(&tenant).await;
    assert_eq!(usage["calls_processed"], 1);
    assert_eq!(usage["transcription_minutes"], 3);
}

#[tokio::test]
async fn test_suspended_tenant_work_waits_for_activation() {
    let env = TestEnv::new().await;
    let tenant = env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    let (_, body) = env.post_cdr("acme", &freepbx_cdr("11.1", "ANSWERED", 60)).await;
    let call_id = body["call_id"].as_str().unwrap().to_string();

    let (status, _) = env
        .post_json(&format!("/tenants/{}/suspend", tenant.id), json!({}))
        .await;
    assert!(status.is_success());
    assert_eq!(env.run_worker().await, 0);
    assert_eq!(env.state.queue.pending_count().await.unwrap(), 1);
    assert_eq!(env.engine.total_calls(), 0);

    let (status, _) = env
        .post_json(&format!("/tenants/{}/activate", tenant.id), json!({}))
        .await;
    assert!(status.is_success());
    assert_eq!(env.run_worker().await, 1);

    let detail = call_detail(&env, &call_id).await;
    assert_eq!(stage(&detail, "summary")["state"], "succeeded");
}

#[tokio::test]
async fn test_unanswered_call_is_not_transcribed() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    let (_, body) = env
        .post_cdr("acme", &json!({"uniqueid": "12.1", "billsec": "0", "disposition": "NO ANSWER"}))
        .await;
    env.run_worker().await;

    let detail = call_detail(&env, body["call_id"].as_str().unwrap()).await;
    assert_eq!(stage(&detail, "transcription")["state"], "skipped_dependency");
    assert_eq!(env.engine.total_calls(), 0);
}

#[tokio::test]
async fn test_stage_error_returns_stage_to_pending_and_task_retries() {
    let env = TestEnv::with_config(|config| {
        config.toml.concurrency.poll_interval_ms = 10;
    })
    .await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;

    // Storing compliance findings fails for one worker pass
    sqlx::query("ALTER TABLE compliance_alerts RENAME TO compliance_alerts_away")
        .execute(&env.db)
        .await
        .unwrap();
    let call_id = ingest_and_run(&env, "12.1", 60).await;
    let id: Uuid = call_id.parse().unwrap();

    let compliance = db::stages::load_stage_result(&env.db, id, Stage::Compliance)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(compliance.state, StageState::Pending);
    assert!(compliance.error.is_some());
    assert_eq!(env.state.queue.pending_count().await.unwrap(), 1);

    sqlx::query("ALTER TABLE compliance_alerts_away RENAME TO compliance_alerts")
        .execute(&env.db)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.run_worker().await, 1);

    let detail = call_detail(&env, &call_id).await;
    for name in ["transcription", "sentiment", "quality", "compliance", "summary"] {
        assert_eq!(stage(&detail, name)["state"], "succeeded", "stage {}", name);
    }
    assert_eq!(detail["compliance_alerts"].as_array().unwrap().len(), 1);
    assert_eq!(env.engine.calls(Stage::Sentiment), 1);
    assert_eq!(env.state.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_slow_stage_does_not_delay_the_others() {
    let env = TestEnv::new().await;
    env.seed_tenant("acme", PbxSystem::FreePbx, "free").await;
    env.engine.hold(Stage::Summary);

    let (_, body) = env.post_cdr("acme", &freepbx_cdr("13.1", "ANSWERED", 60)).await;
    let id: Uuid = body["call_id"].as_str().unwrap().parse().unwrap();

    let watcher = async {
        for _ in 0..500 {
            let results = db::stages::load_stage_results(&env.db, id).await.unwrap();
            let state_of = |s: Stage| results.iter().find(|r| r.stage == s).map(|r| r.state);
            let others_done = [Stage::Sentiment, Stage::Quality, Stage::Compliance]
                .into_iter()
                .all(|s| state_of(s) == Some(StageState::Succeeded));
            if others_done {
                assert_eq!(state_of(Stage::Summary), Some(StageState::Running));
                env.engine.open(Stage::Summary);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        env.engine.open(Stage::Summary);
        panic!("downstream stages were not persisted while summary was held");
    };

    let (completed, ()) = tokio::join!(env.run_worker(), watcher);

    assert_eq!(completed, 1);
    let detail = call_detail(&env, &id.to_string()).await;
    assert_eq!(stage(&detail, "summary")["state"], "succeeded");
}
