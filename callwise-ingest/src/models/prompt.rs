//! Prompt customization model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::Stage;

/// Where a resolved prompt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSource {
    Tenant,
    Default,
}

impl PromptSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptSource::Tenant => "tenant",
            PromptSource::Default => "default",
        }
    }
}

/// Prompt chosen for one stage execution
///
/// Resolved once per stage run and carried with the result, so later
/// customizations never change what an existing result claims it used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPrompt {
    pub tenant_id: Uuid,
    pub feature: Stage,
    pub source: PromptSource,
    pub customization_id: Option<Uuid>,
    pub version: i64,
    pub body: String,
}

impl ResolvedPrompt {
    /// `tenant:<id>/<feature>@v<n>` or `default/<feature>@v<n>`
    pub fn identity(&self) -> String {
        match self.source {
            PromptSource::Tenant => format!(
                "tenant:{}/{}@v{}",
                self.tenant_id, self.feature, self.version
            ),
            PromptSource::Default => format!("default/{}@v{}", self.feature, self.version),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptCustomization {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub feature: Stage,
    pub version: i64,
    pub body: String,
    pub author: String,
    pub signature: String,
    pub restored_from: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

/// SHA-256 over tenant, feature, version, body and author (hex)
pub fn compute_signature(
    tenant_id: Uuid,
    feature: Stage,
    version: i64,
    body: &str,
    author: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(feature.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(version.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(body.as_bytes());
    hasher.update(b"|");
    hasher.update(author.as_bytes());
    format!("{:x}", hasher.finalize())
}
