//! Tenant model
//!
//! A tenant is one customer organization. It is isolated by routing key,
//! webhook credentials and quota, and is never hard-deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Supported PBX families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PbxSystem {
    FreePbx,
    ThreeCx,
    Generic,
}

impl PbxSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            PbxSystem::FreePbx => "freepbx",
            PbxSystem::ThreeCx => "threecx",
            PbxSystem::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "freepbx" => Some(PbxSystem::FreePbx),
            "threecx" | "3cx" => Some(PbxSystem::ThreeCx),
            "generic" => Some(PbxSystem::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for PbxSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

impl TenantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(TenantStatus::Active),
            "suspended" => Some(TenantStatus::Suspended),
            _ => None,
        }
    }
}

/// Connection profile used to download recordings from the tenant's PBX
#[derive(Clone, PartialEq, Eq)]
pub struct PbxProfile {
    pub system: PbxSystem,
    pub base_url: String,
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for PbxProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PbxProfile")
            .field("system", &self.system)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct Tenant {
    pub id: Uuid,
    pub routing_key: String,
    pub display_name: String,
    pub webhook_username: String,
    pub webhook_secret: String,
    pub pbx: PbxProfile,
    pub plan_id: String,
    /// Per-tenant flag overrides (flag key → enabled)
    pub feature_overrides: HashMap<String, bool>,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("routing_key", &self.routing_key)
            .field("display_name", &self.display_name)
            .field("webhook_username", &self.webhook_username)
            .field("pbx", &self.pbx)
            .field("plan_id", &self.plan_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Provisioning request for a new tenant
#[derive(Clone)]
pub struct NewTenant {
    pub routing_key: String,
    pub display_name: String,
    pub webhook_username: String,
    /// Generated when absent
    pub webhook_secret: Option<String>,
    pub pbx: PbxProfile,
    pub plan_id: String,
}
