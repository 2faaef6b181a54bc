//! Configuration resolution for callwise-ingest
//!
//! Root folder: CLI → `CALLWISE_ROOT` → OS default. Deployment settings come
//! from `<root>/callwise.toml`; per-tenant settings live in the database.

use callwise_common::config::{load_toml_config, resolve_root_folder, RootFolder, TomlConfig};
use callwise_common::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::utils::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub root: RootFolder,
    pub toml: TomlConfig,
}

impl ServiceConfig {
    /// Resolve the root folder, create its layout and read `callwise.toml`
    pub fn load(root_arg: Option<&Path>) -> Result<Self> {
        let root = RootFolder::new(resolve_root_folder(root_arg));
        root.ensure_directories()?;
        let toml = load_toml_config(&root.config_path())?;
        Ok(Self { root, toml })
    }

    /// Defaults only, rooted at `root` (tests)
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            root: RootFolder::new(root),
            toml: TomlConfig::default(),
        }
    }

    /// CLI override, else `[server] bind`
    pub fn bind_address(&self, cli_override: Option<&str>) -> String {
        cli_override
            .map(str::to_string)
            .unwrap_or_else(|| self.toml.server.bind.clone())
    }

    pub fn log_level(&self) -> &str {
        &self.toml.logging.level
    }

    pub fn lock_wait_ms(&self) -> u64 {
        self.toml.database.lock_wait_ms
    }

    pub fn recording_retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.toml.retry.recording)
    }

    pub fn stage_retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.toml.retry.stage)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.toml.concurrency.poll_interval_ms.max(10))
    }

    pub fn pbx_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.engine.timeout_secs.max(1))
    }
}
