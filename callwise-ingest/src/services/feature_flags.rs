//! Feature flag evaluation
//!
//! Evaluation order for tenant T and flag F:
//! 1. T's explicit override for F
//! 2. T is on F's tenant allow-list → enabled
//! 3. T's plan is on F's plan allow-list → enabled
//! 4. F globally off → disabled
//! 5. deterministic bucket of (T, F) below the rollout percentage → enabled
//!
//! A flag that does not exist is enabled.

use callwise_common::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db;
use crate::models::{FeatureFlag, Tenant};

/// Stable 0-99 bucket: first 8 bytes of SHA-256(`tenant_id:flag_key`) mod 100
pub fn rollout_bucket(tenant_id: Uuid, flag_key: &str) -> u8 {
    let digest = Sha256::digest(format!("{}:{}", tenant_id, flag_key).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Pure evaluation of one (possibly missing) flag for one tenant
pub fn evaluate(flag: Option<&FeatureFlag>, key: &str, tenant: &Tenant) -> bool {
    if let Some(value) = tenant.feature_overrides.get(key) {
        return *value;
    }

    let Some(flag) = flag else {
        return true;
    };

    if flag.allowed_tenants.contains(&tenant.id) {
        return true;
    }
    if flag.allowed_plans.iter().any(|p| p == &tenant.plan_id) {
        return true;
    }
    if !flag.enabled {
        return false;
    }

    rollout_bucket(tenant.id, &flag.key) < flag.rollout_percentage
}

#[derive(Clone)]
pub struct FeatureFlagService {
    pool: SqlitePool,
}

impl FeatureFlagService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Flags are read on every evaluation; there is no cache to go stale
    pub async fn is_enabled(&self, tenant: &Tenant, key: &str) -> Result<bool> {
        let flag = db::flags::load_flag(&self.pool, key).await?;
        Ok(evaluate(flag.as_ref(), key, tenant))
    }

    pub async fn set_flag(&self, flag: &FeatureFlag) -> Result<()> {
        db::flags::upsert_flag(&self.pool, flag).await
    }

    pub async fn list(&self) -> Result<Vec<FeatureFlag>> {
        db::flags::list_flags(&self.pool).await
    }
}
