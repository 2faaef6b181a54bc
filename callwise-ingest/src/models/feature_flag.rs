//! Feature flag definition

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally defined flag, evaluated per tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    /// 0-100
    pub rollout_percentage: u8,
    #[serde(default)]
    pub allowed_plans: Vec<String>,
    #[serde(default)]
    pub allowed_tenants: Vec<Uuid>,
}

impl FeatureFlag {
    /// Fully enabled flag with no allow-lists
    pub fn enabled(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enabled: true,
            rollout_percentage: 100,
            allowed_plans: Vec::new(),
            allowed_tenants: Vec::new(),
        }
    }

    pub fn disabled(key: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::enabled(key)
        }
    }
}
