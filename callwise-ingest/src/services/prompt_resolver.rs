//! Prompt resolution service
//!
//! A tenant's active customization wins over the global default. Every
//! change appends a new version; nothing is edited in place.

use callwise_common::{Error, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::models::{PromptCustomization, PromptSource, ResolvedPrompt, Stage};

#[derive(Clone)]
pub struct PromptService {
    pool: SqlitePool,
}

impl PromptService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Active customization, else the global default
    pub async fn resolve(&self, tenant_id: Uuid, feature: Stage) -> Result<ResolvedPrompt> {
        if let Some(active) = db::prompts::load_active(&self.pool, tenant_id, feature).await? {
            return Ok(ResolvedPrompt {
                tenant_id,
                feature,
                source: PromptSource::Tenant,
                customization_id: Some(active.id),
                version: active.version,
                body: active.body,
            });
        }

        let (version, body) = db::prompts::load_default(&self.pool, feature)
            .await?
            .ok_or_else(|| Error::Internal(format!("No default prompt for {}", feature)))?;

        Ok(ResolvedPrompt {
            tenant_id,
            feature,
            source: PromptSource::Default,
            customization_id: None,
            version,
            body,
        })
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        feature: Stage,
        body: &str,
        author: &str,
    ) -> Result<PromptCustomization> {
        if body.trim().is_empty() {
            return Err(Error::InvalidInput("Prompt body must not be empty".to_string()));
        }
        if author.trim().is_empty() {
            return Err(Error::InvalidInput("Prompt author must not be empty".to_string()));
        }

        let created = db::prompts::insert_active_version(
            &self.pool,
            tenant_id,
            feature,
            body,
            author.trim(),
            None,
            Utc::now(),
        )
        .await?;

        info!(
            tenant_id = %tenant_id,
            feature = %feature,
            version = created.version,
            author = %created.author,
            "Prompt customization activated"
        );
        Ok(created)
    }

    /// All versions, newest first
    pub async fn history(&self, tenant_id: Uuid, feature: Stage) -> Result<Vec<PromptCustomization>> {
        db::prompts::history(&self.pool, tenant_id, feature).await
    }

    /// Append a copy of `version` as the new active version
    pub async fn restore(
        &self,
        tenant_id: Uuid,
        feature: Stage,
        version: i64,
        author: &str,
    ) -> Result<PromptCustomization> {
        if author.trim().is_empty() {
            return Err(Error::InvalidInput("Prompt author must not be empty".to_string()));
        }

        let source = db::prompts::load_version(&self.pool, tenant_id, feature, version)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Prompt {} version {} for tenant {}", feature, version, tenant_id))
            })?;

        let restored = db::prompts::insert_active_version(
            &self.pool,
            tenant_id,
            feature,
            &source.body,
            author.trim(),
            Some(version),
            Utc::now(),
        )
        .await?;

        info!(
            tenant_id = %tenant_id,
            feature = %feature,
            version = restored.version,
            restored_from = version,
            "Prompt version restored"
        );
        Ok(restored)
    }

    /// Drop back to the global default; returns false if nothing was active
    pub async fn deactivate(&self, tenant_id: Uuid, feature: Stage) -> Result<bool> {
        let changed = db::prompts::deactivate(&self.pool, tenant_id, feature).await?;
        if changed {
            info!(tenant_id = %tenant_id, feature = %feature, "Prompt customization deactivated");
        }
        Ok(changed)
    }
}
