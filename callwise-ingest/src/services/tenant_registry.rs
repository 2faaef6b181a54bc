//! Tenant registry
//!
//! Explicit lookup by routing key with a cache that is invalidated on every
//! write that goes through the registry (status change, credential rotation).
//! Entries also expire after `CACHE_TTL`, which bounds how long a change made
//! by another process (the `tenant` CLI) stays invisible.
//! Webhook authentication happens here.

use callwise_common::api::{credentials_match, generate_webhook_secret, parse_basic_authorization};
use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db;
use crate::error::PipelineError;
use crate::models::{NewTenant, Tenant, TenantStatus};

const CACHE_TTL: Duration = Duration::from_secs(30);
const UNKNOWN_TENANT_USERNAME: &str = "unknown-tenant";

#[derive(Clone)]
pub struct TenantRegistry {
    pool: SqlitePool,
    by_routing_key: Arc<RwLock<HashMap<String, (Tenant, Instant)>>>,
    /// Compared against when the routing key is unknown; never stored
    decoy_secret: Arc<str>,
}

impl TenantRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            by_routing_key: Arc::new(RwLock::new(HashMap::new())),
            decoy_secret: Arc::from(generate_webhook_secret()),
        }
    }

    /// Tenant for a routing key, from cache or database
    pub async fn resolve(&self, routing_key: &str) -> Result<Option<Tenant>> {
        if let Some((tenant, cached_at)) = self.by_routing_key.read().await.get(routing_key) {
            if cached_at.elapsed() < CACHE_TTL {
                return Ok(Some(tenant.clone()));
            }
        }

        let tenant = db::tenants::load_by_routing_key(&self.pool, routing_key).await?;
        if let Some(tenant) = &tenant {
            self.by_routing_key
                .write()
                .await
                .insert(routing_key.to_string(), (tenant.clone(), Instant::now()));
        }
        Ok(tenant)
    }

    /// Authoritative lookup by id (never cached; used where status must be fresh)
    pub async fn get(&self, tenant_id: Uuid) -> Result<Option<Tenant>> {
        db::tenants::load_tenant(&self.pool, tenant_id).await
    }

    pub async fn list(&self) -> Result<Vec<Tenant>> {
        db::tenants::list_tenants(&self.pool).await
    }

    /// Authenticate a webhook delivery: known, active tenant with matching credentials
    ///
    /// Every failure is reported as the same `Authentication` error class;
    /// the detail only goes to the log.
    pub async fn authenticate(
        &self,
        routing_key: &str,
        authorization: Option<&str>,
    ) -> std::result::Result<Tenant, PipelineError> {
        let Some(tenant) = self.resolve(routing_key).await? else {
            // Unknown keys do the same HMAC work as known ones
            let _ = verify_credentials(UNKNOWN_TENANT_USERNAME, &self.decoy_secret, authorization);
            return Err(reject(routing_key, "unknown routing key"));
        };

        if !tenant.is_active() {
            return Err(reject(routing_key, "tenant suspended"));
        }

        verify_credentials(&tenant.webhook_username, &tenant.webhook_secret, authorization)
            .map_err(|reason| reject(routing_key, &reason))?;

        debug!(tenant_id = %tenant.id, routing_key, "Webhook delivery authenticated");
        Ok(tenant)
    }

    /// Create a tenant; a webhook secret is generated when none is given
    pub async fn provision(&self, request: NewTenant) -> Result<Tenant> {
        if request.routing_key.trim().is_empty() {
            return Err(Error::InvalidInput("routing key must not be empty".to_string()));
        }
        if db::tenants::load_by_routing_key(&self.pool, request.routing_key.trim())
            .await?
            .is_some()
        {
            return Err(Error::InvalidInput(format!(
                "routing key already in use: {}",
                request.routing_key.trim()
            )));
        }
        if db::plans::load_plan(&self.pool, &request.plan_id).await?.is_none() {
            return Err(Error::InvalidInput(format!("unknown plan: {}", request.plan_id)));
        }

        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            routing_key: request.routing_key.trim().to_string(),
            display_name: request.display_name,
            webhook_username: request.webhook_username,
            webhook_secret: request.webhook_secret.unwrap_or_else(generate_webhook_secret),
            pbx: request.pbx,
            plan_id: request.plan_id,
            feature_overrides: HashMap::new(),
            status: TenantStatus::Active,
            created_at: now,
            updated_at: now,
        };

        db::tenants::insert_tenant(&self.pool, &tenant).await?;
        self.invalidate(&tenant.routing_key).await;
        info!(tenant_id = %tenant.id, routing_key = %tenant.routing_key, "Tenant provisioned");
        Ok(tenant)
    }

    pub async fn suspend(&self, tenant_id: Uuid) -> Result<Tenant> {
        self.set_status(tenant_id, TenantStatus::Suspended).await
    }

    pub async fn activate(&self, tenant_id: Uuid) -> Result<Tenant> {
        self.set_status(tenant_id, TenantStatus::Active).await
    }

    async fn set_status(&self, tenant_id: Uuid, status: TenantStatus) -> Result<Tenant> {
        if !db::tenants::set_status(&self.pool, tenant_id, status).await? {
            return Err(Error::NotFound(format!("tenant {}", tenant_id)));
        }
        let tenant = self.reload(tenant_id).await?;
        info!(tenant_id = %tenant_id, status = status.as_str(), "Tenant status changed");
        Ok(tenant)
    }

    /// Replace the webhook secret; returns the updated tenant
    pub async fn rotate_webhook_secret(&self, tenant_id: Uuid) -> Result<Tenant> {
        let tenant = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tenant {}", tenant_id)))?;
        let secret = generate_webhook_secret();
        db::tenants::update_webhook_credentials(&self.pool, tenant_id, &tenant.webhook_username, &secret)
            .await?;
        self.reload(tenant_id).await
    }

    /// Set one per-tenant flag override
    pub async fn set_feature_override(&self, tenant_id: Uuid, key: &str, enabled: bool) -> Result<Tenant> {
        let mut tenant = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tenant {}", tenant_id)))?;
        tenant.feature_overrides.insert(key.to_string(), enabled);
        db::tenants::set_feature_override(&self.pool, tenant_id, &tenant.feature_overrides).await?;
        self.reload(tenant_id).await
    }

    /// Read back after a write and drop the cached entry
    async fn reload(&self, tenant_id: Uuid) -> Result<Tenant> {
        let tenant = self
            .get(tenant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("tenant {}", tenant_id)))?;
        self.invalidate(&tenant.routing_key).await;
        Ok(tenant)
    }

    pub async fn invalidate(&self, routing_key: &str) {
        self.by_routing_key.write().await.remove(routing_key);
    }
}

/// Parse the header and compare it with the expected pair; `Err` carries the log reason
fn verify_credentials(
    expected_username: &str,
    expected_secret: &str,
    authorization: Option<&str>,
) -> std::result::Result<(), String> {
    let header = authorization.ok_or_else(|| "missing Authorization header".to_string())?;
    let presented = parse_basic_authorization(header).map_err(|e| e.to_string())?;
    if credentials_match(expected_username, expected_secret, &presented) {
        Ok(())
    } else {
        Err("credential mismatch".to_string())
    }
}

fn reject(routing_key: &str, reason: &str) -> PipelineError {
    warn!(routing_key, reason, "Webhook authentication rejected");
    PipelineError::Authentication("invalid webhook credentials".to_string())
}
