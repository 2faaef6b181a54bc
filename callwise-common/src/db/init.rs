//! Database initialization
//!
//! Creates the shared Callwise schema on first run and seeds the rows every
//! deployment needs (plans, default prompts). All statements are idempotent,
//! so startup can run them unconditionally.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Per-connection SQLite busy timeout
const BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // PRAGMAs are per connection, so they go on the connect options rather
    // than a one-off query against a single pooled connection.
    // WAL allows concurrent readers with one writer: webhook ingestion and
    // background enrichment write at the same time.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables, indexes and seed rows (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_plans_table(pool).await?;
    create_tenants_table(pool).await?;
    create_call_records_table(pool).await?;
    create_recordings_table(pool).await?;
    create_stage_results_table(pool).await?;
    create_compliance_alerts_table(pool).await?;
    create_prompt_tables(pool).await?;
    create_feature_flags_table(pool).await?;
    create_usage_counters_table(pool).await?;
    create_enrichment_tasks_table(pool).await?;
    create_alerts_table(pool).await?;

    seed_plans(pool).await?;
    seed_default_prompts(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Plans: a NULL limit means unlimited
async fn create_plans_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            max_calls_processed INTEGER,
            max_transcription_minutes INTEGER,
            max_storage_bytes INTEGER,
            max_api_calls INTEGER,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_tenants_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            routing_key TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            webhook_username TEXT NOT NULL,
            webhook_secret TEXT NOT NULL,
            pbx_system TEXT NOT NULL DEFAULT 'generic',
            pbx_base_url TEXT NOT NULL DEFAULT '',
            pbx_username TEXT NOT NULL DEFAULT '',
            pbx_secret TEXT NOT NULL DEFAULT '',
            plan_id TEXT NOT NULL REFERENCES plans(id),
            feature_overrides TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'suspended')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Call records keyed by the PBX idempotency key (tenant_id, uniqueid)
///
/// `finalize_token` is written by the same statement that first sets a final
/// disposition, which lets the merging writer detect that it finalized the row.
async fn create_call_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS call_records (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL REFERENCES tenants(id),
            uniqueid TEXT NOT NULL,
            source_number TEXT,
            destination_number TEXT,
            started_at TEXT,
            duration_seconds INTEGER,
            disposition TEXT,
            recording_ref TEXT,
            pbx_system TEXT NOT NULL,
            raw_payload TEXT NOT NULL,
            finalize_token TEXT,
            finalized_at TEXT,
            usage_charged INTEGER NOT NULL DEFAULT 0,
            minutes_charged INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (tenant_id, uniqueid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_call_records_tenant_created ON call_records(tenant_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_recordings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recordings (
            call_id TEXT PRIMARY KEY REFERENCES call_records(id),
            tenant_id TEXT NOT NULL REFERENCES tenants(id),
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'fetched', 'failed', 'unavailable')),
            file_path TEXT,
            size_bytes INTEGER,
            content_type TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            fetched_at TEXT,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_stage_results_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_results (
            call_id TEXT NOT NULL REFERENCES call_records(id),
            stage TEXT NOT NULL
                CHECK (stage IN ('transcription', 'sentiment', 'quality', 'compliance', 'summary')),
            state TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            prompt_source TEXT,
            prompt_customization_id TEXT,
            prompt_version INTEGER,
            prompt_identity TEXT,
            output TEXT,
            started_at TEXT,
            finished_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (call_id, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_compliance_alerts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS compliance_alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id TEXT NOT NULL REFERENCES call_records(id),
            rule TEXT NOT NULL,
            severity TEXT NOT NULL,
            excerpt TEXT,
            prompt_identity TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_compliance_alerts_call ON compliance_alerts(call_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Default prompts plus per-tenant versioned customizations
///
/// The partial unique index guarantees at most one active version per
/// (tenant, feature).
async fn create_prompt_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS default_prompts (
            feature_slug TEXT PRIMARY KEY,
            version INTEGER NOT NULL DEFAULT 1,
            body TEXT NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS prompt_customizations (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL REFERENCES tenants(id),
            feature_slug TEXT NOT NULL,
            version INTEGER NOT NULL,
            body TEXT NOT NULL,
            author TEXT NOT NULL,
            signature TEXT NOT NULL,
            restored_from INTEGER,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            activated_at TEXT,
            UNIQUE (tenant_id, feature_slug, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_prompt_one_active
        ON prompt_customizations(tenant_id, feature_slug)
        WHERE is_active = 1
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_feature_flags_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_flags (
            key TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            rollout_percentage INTEGER NOT NULL DEFAULT 100
                CHECK (rollout_percentage BETWEEN 0 AND 100),
            allowed_plans TEXT NOT NULL DEFAULT '[]',
            allowed_tenants TEXT NOT NULL DEFAULT '[]',
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_usage_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_counters (
            tenant_id TEXT NOT NULL REFERENCES tenants(id),
            period TEXT NOT NULL,
            calls_processed INTEGER NOT NULL DEFAULT 0,
            transcription_minutes INTEGER NOT NULL DEFAULT 0,
            storage_bytes INTEGER NOT NULL DEFAULT 0,
            api_calls INTEGER NOT NULL DEFAULT 0,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (tenant_id, period)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Persisted work queue
///
/// The partial unique index allows exactly one `pipeline` task per call for
/// all time, and at most one open task of any other kind per call.
async fn create_enrichment_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS enrichment_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            call_id TEXT NOT NULL REFERENCES call_records(id),
            tenant_id TEXT NOT NULL REFERENCES tenants(id),
            kind TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'pending'
                CHECK (state IN ('pending', 'running', 'done')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            -- Unix millis before which the task is not claimed again
            available_at INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_enrichment_tasks_dedup
        ON enrichment_tasks(call_id, kind)
        WHERE kind = 'pipeline' OR state != 'done'
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_enrichment_tasks_state ON enrichment_tasks(state, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_alerts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant_id TEXT,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            occurrences INTEGER NOT NULL DEFAULT 1,
            raised_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            acknowledged_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Seed the built-in plans (existing rows are left untouched)
async fn seed_plans(pool: &SqlitePool) -> Result<()> {
    const GIB: i64 = 1024 * 1024 * 1024;
    let plans: [(&str, &str, Option<i64>, Option<i64>, Option<i64>, Option<i64>); 4] = [
        ("free", "Free", Some(100), Some(200), Some(GIB), Some(500)),
        ("starter", "Starter", Some(1_000), Some(3_000), Some(10 * GIB), Some(5_000)),
        ("pro", "Pro", Some(10_000), Some(30_000), Some(100 * GIB), Some(50_000)),
        ("enterprise", "Enterprise", None, None, None, None),
    ];

    for (id, name, calls, minutes, storage, api_calls) in plans {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO plans
                (id, name, max_calls_processed, max_transcription_minutes, max_storage_bytes, max_api_calls)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(calls)
        .bind(minutes)
        .bind(storage)
        .bind(api_calls)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Seed the global default prompt for each enrichment feature
async fn seed_default_prompts(pool: &SqlitePool) -> Result<()> {
    let defaults = [
        (
            "transcription",
            "Transcribe the business phone call verbatim. Label speakers as Agent and Caller when distinguishable.",
        ),
        (
            "sentiment",
            "Classify the caller's overall sentiment in this call transcript. Reply with JSON {\"label\": \"positive|neutral|negative|mixed\", \"score\": -1.0..1.0}.",
        ),
        (
            "quality",
            "Score the agent's handling of this call from 0 to 100 (greeting, clarity, resolution, courtesy). Reply with JSON {\"score\": number, \"rationale\": string}.",
        ),
        (
            "compliance",
            "List compliance issues in this call transcript (missing disclosures, sensitive data spoken aloud, prohibited promises). Reply with JSON {\"alerts\": [{\"rule\": string, \"severity\": \"low|medium|high|critical\", \"excerpt\": string}]}.",
        ),
        (
            "summary",
            "Summarize this call in three sentences or fewer, including the caller's request and the outcome. Reply with JSON {\"summary\": string}.",
        ),
    ];

    for (slug, body) in defaults {
        sqlx::query("INSERT OR IGNORE INTO default_prompts (feature_slug, version, body) VALUES (?, 1, ?)")
            .bind(slug)
            .bind(body)
            .execute(pool)
            .await?;
    }

    Ok(())
}
