//! Configuration loading and root folder resolution
//!
//! Implements two-tier configuration:
//! 1. **TOML Bootstrap**: bind address, logging, retry/concurrency policy,
//!    AI engine endpoint (per deployment, read once at startup)
//! 2. **Database Runtime**: tenants, plans, feature flags and prompts
//!    (per tenant, never from environment variables)
//!
//! # Root Folder Priority
//!
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`CALLWISE_ROOT`)
//! 3. OS-dependent compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "CALLWISE_ROOT";

/// Environment variable overriding `[engine] api_key`
pub const ENGINE_API_KEY_ENV: &str = "CALLWISE_ENGINE_API_KEY";

/// Name of the TOML file inside the root folder
pub const CONFIG_FILE_NAME: &str = "callwise.toml";

/// Name of the SQLite database file inside the root folder
pub const DATABASE_FILE_NAME: &str = "callwise.db";

// ============================================================================
// Root Folder
// ============================================================================

/// Root folder resolution following the CLI → ENV → default priority order
pub fn resolve_root_folder(cli_arg: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: OS-dependent compiled default
    default_root_folder()
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/callwise (or /var/lib/callwise for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("callwise"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/callwise"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("callwise"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/callwise"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("callwise"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\callwise"))
    } else {
        PathBuf::from("./callwise_data")
    }
}

/// Creates the root folder layout and derives file locations from it
#[derive(Debug, Clone)]
pub struct RootFolder {
    root: PathBuf,
}

impl RootFolder {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create root folder and recordings directory if missing
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.recordings_dir())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// Directory holding fetched call recordings
    pub fn recordings_dir(&self) -> PathBuf {
        self.root.join("recordings")
    }
}

// ============================================================================
// TOML Bootstrap Configuration
// ============================================================================

/// Bootstrap configuration loaded from `callwise.toml`
///
/// Every section is optional; missing values fall back to built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub alerts: AlertConfig,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Listen address (default `127.0.0.1:5740`)
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Database tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatabaseConfig {
    /// Maximum total time to retry an operation that hit "database is locked"
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

/// Retry policies for the two retrying components
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "RetryPolicyConfig::recording_default")]
    pub recording: RetryPolicyConfig,

    #[serde(default = "RetryPolicyConfig::stage_default")]
    pub stage: RetryPolicyConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            recording: RetryPolicyConfig::recording_default(),
            stage: RetryPolicyConfig::stage_default(),
        }
    }
}

/// Bounded exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicyConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicyConfig {
    pub fn recording_default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }

    pub fn stage_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 20_000,
            multiplier: 2.0,
        }
    }
}

/// Concurrency caps per external dependency
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    /// Simultaneous recording downloads from one tenant's PBX
    #[serde(default = "default_pbx_downloads")]
    pub pbx_downloads_per_tenant: usize,

    /// Simultaneous calls to the AI engine across all tenants
    #[serde(default = "default_ai_in_flight")]
    pub ai_max_in_flight: usize,

    /// Request rate towards the AI engine
    #[serde(default = "default_ai_rps")]
    pub ai_requests_per_second: u32,

    /// Enrichment tasks processed at once by the background worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Fallback poll interval when no enqueue notification arrives
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            pbx_downloads_per_tenant: default_pbx_downloads(),
            ai_max_in_flight: default_ai_in_flight(),
            ai_requests_per_second: default_ai_rps(),
            worker_concurrency: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// OpenAI-compatible AI engine endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_engine_url")]
    pub base_url: String,

    /// API key; `CALLWISE_ENGINE_API_KEY` overrides this value
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,

    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,

    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            api_key: None,
            transcription_model: default_transcription_model(),
            analysis_model: default_analysis_model(),
            timeout_secs: default_engine_timeout(),
        }
    }
}

impl EngineConfig {
    /// Resolve the API key: environment first, then TOML
    pub fn resolve_api_key(&self) -> Option<String> {
        std::env::var(ENGINE_API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.api_key.clone().filter(|k| !k.trim().is_empty()))
    }
}

/// Alert thresholds (occurrences inside `window_secs` that raise an alert)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertConfig {
    #[serde(default = "default_alert_window")]
    pub window_secs: u64,

    #[serde(default = "default_fetch_failure_threshold")]
    pub fetch_failure_threshold: u32,

    #[serde(default = "default_stage_failure_threshold")]
    pub stage_failure_threshold: u32,

    #[serde(default = "default_quota_threshold")]
    pub quota_threshold: u32,

    #[serde(default = "default_malformed_threshold")]
    pub malformed_payload_threshold: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_secs: default_alert_window(),
            fetch_failure_threshold: default_fetch_failure_threshold(),
            stage_failure_threshold: default_stage_failure_threshold(),
            quota_threshold: default_quota_threshold(),
            malformed_payload_threshold: default_malformed_threshold(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5740".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lock_wait_ms() -> u64 {
    5000
}

fn default_pbx_downloads() -> usize {
    2
}

fn default_ai_in_flight() -> usize {
    8
}

fn default_ai_rps() -> u32 {
    5
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_engine_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_analysis_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_engine_timeout() -> u64 {
    120
}

fn default_alert_window() -> u64 {
    3600
}

fn default_fetch_failure_threshold() -> u32 {
    3
}

fn default_stage_failure_threshold() -> u32 {
    5
}

fn default_quota_threshold() -> u32 {
    1
}

fn default_malformed_threshold() -> u32 {
    10
}

/// Load TOML configuration, returning defaults if the file does not exist
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        tracing::info!("No config file at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    validate_config(&config)?;
    Ok(config)
}

/// Write TOML configuration atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Reject policies that would disable a bounded resource entirely
fn validate_config(config: &TomlConfig) -> Result<()> {
    for (name, policy) in [
        ("retry.recording", &config.retry.recording),
        ("retry.stage", &config.retry.stage),
    ] {
        if policy.max_attempts == 0 {
            return Err(Error::Config(format!("{}.max_attempts must be >= 1", name)));
        }
        if policy.multiplier < 1.0 {
            return Err(Error::Config(format!("{}.multiplier must be >= 1.0", name)));
        }
    }

    let c = &config.concurrency;
    if c.pbx_downloads_per_tenant == 0 || c.ai_max_in_flight == 0 || c.worker_concurrency == 0 {
        return Err(Error::Config(
            "concurrency limits must be >= 1".to_string(),
        ));
    }
    if c.ai_requests_per_second == 0 {
        return Err(Error::Config(
            "concurrency.ai_requests_per_second must be >= 1".to_string(),
        ));
    }

    Ok(())
}
