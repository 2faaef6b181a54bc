//! callwise-ingest - multi-tenant call ingestion and enrichment service
//!
//! Receives CDR webhooks from tenant PBXs, fetches call recordings and runs
//! the AI enrichment pipeline in a background worker.

use anyhow::{Context, Result};
use callwise_common::db::init_database;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use callwise_ingest::config::ServiceConfig;
use callwise_ingest::models::{NewTenant, PbxProfile, PbxSystem};
use callwise_ingest::services::{HttpEnrichmentEngine, HttpPbxClient, TenantRegistry};
use callwise_ingest::{build_router, build_services};

/// Command-line arguments for callwise-ingest
#[derive(Parser, Debug)]
#[command(name = "callwise-ingest")]
#[command(about = "Multi-tenant call ingestion and enrichment service")]
#[command(version)]
struct Args {
    /// Root folder holding the database, config file and recordings
    #[arg(long, env = "CALLWISE_ROOT", global = true)]
    root_folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and enrichment worker (default)
    Serve {
        /// Listen address, overrides `[server] bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Tenant administration
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },
}

#[derive(Subcommand, Debug)]
enum TenantAction {
    /// Provision a tenant; prints the webhook secret once
    Add {
        #[arg(long)]
        routing_key: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "pbx")]
        webhook_username: String,
        /// Generated when omitted
        #[arg(long)]
        webhook_secret: Option<String>,
        /// freepbx, threecx or generic
        #[arg(long, default_value = "generic")]
        pbx_system: String,
        #[arg(long, default_value = "")]
        pbx_base_url: String,
        #[arg(long, default_value = "")]
        pbx_username: String,
        #[arg(long, env = "CALLWISE_PBX_SECRET", default_value = "")]
        pbx_secret: String,
        #[arg(long, default_value = "free")]
        plan: String,
    },
    /// Reject webhooks and defer queued work for a tenant
    Suspend { tenant_id: Uuid },
    /// Re-enable a suspended tenant
    Activate { tenant_id: Uuid },
    /// List tenants
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServiceConfig::load(args.root_folder.as_deref())
        .context("Failed to load configuration")?;

    // RUST_LOG wins over `[logging] level`
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting Callwise Ingest (callwise-ingest) v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );
    info!("Root folder: {}", config.root.path().display());

    let db_path = config.root.database_path();
    info!("Database: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .context("Failed to initialize database")?;

    match args.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => serve(config, pool, bind).await,
        Command::Tenant { action } => tenant_command(pool, action).await,
    }
}

async fn serve(config: ServiceConfig, pool: sqlx::SqlitePool, bind: Option<String>) -> Result<()> {
    let engine = Arc::new(
        HttpEnrichmentEngine::new(&config.toml.engine, config.toml.concurrency.ai_requests_per_second)
            .context("Failed to initialize enrichment engine")?,
    );
    if config.toml.engine.resolve_api_key().is_none() {
        warn!("No enrichment engine API key configured; engine calls will be unauthenticated");
    }
    let pbx_client = Arc::new(HttpPbxClient::new(config.pbx_timeout()).context("Failed to initialize PBX client")?);

    let services = build_services(pool, &config, engine, pbx_client);

    // Work interrupted by a previous shutdown or crash goes back to pending
    let (tasks, stages) = services
        .state
        .queue
        .recover()
        .await
        .context("Failed to recover interrupted work")?;
    info!(tasks, stages, "Startup recovery complete");

    let cancel = CancellationToken::new();
    let worker_handle = tokio::spawn(services.worker.run(cancel.clone()));

    let app = build_router(services.state);
    let addr = config.bind_address(bind.as_deref());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("Server error")?;

    cancel.cancel();
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "Enrichment worker ended abnormally");
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn tenant_command(pool: sqlx::SqlitePool, action: TenantAction) -> Result<()> {
    let registry = TenantRegistry::new(pool);

    match action {
        TenantAction::Add {
            routing_key,
            name,
            webhook_username,
            webhook_secret,
            pbx_system,
            pbx_base_url,
            pbx_username,
            pbx_secret,
            plan,
        } => {
            let system = PbxSystem::parse(&pbx_system)
                .with_context(|| format!("Unknown PBX system: {}", pbx_system))?;
            let tenant = registry
                .provision(NewTenant {
                    routing_key,
                    display_name: name,
                    webhook_username,
                    webhook_secret,
                    pbx: PbxProfile {
                        system,
                        base_url: pbx_base_url,
                        username: pbx_username,
                        secret: pbx_secret,
                    },
                    plan_id: plan,
                })
                .await?;
            println!("tenant_id:      {}", tenant.id);
            println!("routing_key:    {}", tenant.routing_key);
            println!("webhook user:   {}", tenant.webhook_username);
            println!("webhook secret: {}", tenant.webhook_secret);
            println!("webhook url:    /webhook/cdr/{}", tenant.routing_key);
        }
        TenantAction::Suspend { tenant_id } => {
            let tenant = registry.suspend(tenant_id).await?;
            println!("{} ({}) suspended", tenant.routing_key, tenant.id);
        }
        TenantAction::Activate { tenant_id } => {
            let tenant = registry.activate(tenant_id).await?;
            println!("{} ({}) active", tenant.routing_key, tenant.id);
        }
        TenantAction::List => {
            for tenant in registry.list().await? {
                println!(
                    "{}  {:<20} {:<10} {:<9} {}",
                    tenant.id,
                    tenant.routing_key,
                    tenant.plan_id,
                    tenant.status.as_str(),
                    tenant.pbx.system
                );
            }
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
