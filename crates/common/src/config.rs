//! Run and cleanup configuration
//!
//! Configuration comes from a global `tidyrun.toml` and from the `cleanup:`
//! sections of pipeline, workflow and test definitions. Sections are layered
//! test > workflow > pipeline > global, and a more specific section replaces
//! a less specific one wholesale (no deep merge).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// File name searched for in the working directory
pub const CONFIG_FILE_NAME: &str = "tidyrun.toml";

/// Environment variable supplying the provider API key
pub const PROVIDER_API_KEY_ENV: &str = "TIDYRUN_PROVIDER_API_KEY";

/// Default cleanup attempts per resource
pub const DEFAULT_RETRIES: u32 = 3;

// ============================================================================
// Cleanup
// ============================================================================

/// Cleanup configuration for one pipeline, workflow or test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Whether cleanup runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Provider name (`appwrite`, `http`, or any custom name)
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Delete resources concurrently instead of one at a time
    #[serde(default)]
    pub parallel: bool,

    /// Attempts per resource
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Explicit handler files
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<PathBuf>,

    /// Handler auto-discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discover: Option<DiscoverConfig>,

    /// Scan provider storage for resources that were never reported
    #[serde(default)]
    pub scan_untracked: bool,

    /// Resource type -> handler name (`method` or `provider.method`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub types: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appwrite: Option<AppwriteConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpProviderConfig>,

    /// Settings for providers without a dedicated section
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

fn default_provider() -> String {
    "custom".to_string()
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: default_provider(),
            parallel: false,
            retries: DEFAULT_RETRIES,
            handlers: Vec::new(),
            discover: None,
            scan_untracked: false,
            types: BTreeMap::new(),
            appwrite: None,
            http: None,
            settings: BTreeMap::new(),
        }
    }
}

impl CleanupConfig {
    /// Resolve the provider-specific section into a typed provider config.
    pub fn provider_config(&self) -> Result<ProviderConfig> {
        match ProviderKind::from_name(&self.provider) {
            ProviderKind::Appwrite => self
                .appwrite
                .clone()
                .map(ProviderConfig::Appwrite)
                .ok_or_else(|| {
                    Error::InvalidConfig("cleanup provider 'appwrite' needs an [appwrite] section".into())
                }),
            ProviderKind::Http => self
                .http
                .clone()
                .map(ProviderConfig::Http)
                .ok_or_else(|| {
                    Error::InvalidConfig("cleanup provider 'http' needs an [http] section".into())
                }),
            ProviderKind::Other => Ok(ProviderConfig::Other {
                name: self.provider.clone(),
                settings: self.settings.clone(),
            }),
        }
    }

    /// Attempts per resource, never less than one
    pub fn attempts(&self) -> u32 {
        self.retries.max(1)
    }
}

/// Handler auto-discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverConfig {
    /// Directories to search
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// File name pattern
    #[serde(default = "default_discover_pattern")]
    pub pattern: String,
}

fn default_discover_pattern() -> String {
    "*.handlers.yaml".to_string()
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            paths: vec![PathBuf::from("cleanup")],
            pattern: default_discover_pattern(),
        }
    }
}

/// Known provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Appwrite,
    Http,
    Other,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "appwrite" => ProviderKind::Appwrite,
            "http" => ProviderKind::Http,
            _ => ProviderKind::Other,
        }
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Appwrite(AppwriteConfig),
    Http(HttpProviderConfig),
    Other {
        name: String,
        #[serde(default)]
        settings: BTreeMap<String, serde_json::Value>,
    },
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Appwrite(_) => "appwrite",
            ProviderConfig::Http(_) => "http",
            ProviderConfig::Other { name, .. } => name,
        }
    }

    /// Copy with every secret removed, safe to persist.
    pub fn redacted(&self) -> Self {
        match self {
            ProviderConfig::Appwrite(cfg) => ProviderConfig::Appwrite(AppwriteConfig {
                api_key: None,
                ..cfg.clone()
            }),
            ProviderConfig::Http(cfg) => ProviderConfig::Http(HttpProviderConfig {
                secret_headers: BTreeMap::new(),
                ..cfg.clone()
            }),
            ProviderConfig::Other { name, settings } => ProviderConfig::Other {
                name: name.clone(),
                settings: settings
                    .iter()
                    .filter(|(k, _)| !is_secret_key(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
        }
    }

    /// Re-attach secrets from a live configuration of the same provider.
    pub fn with_secrets_from(&self, live: &ProviderConfig) -> Self {
        match (self, live) {
            (ProviderConfig::Appwrite(saved), ProviderConfig::Appwrite(live)) => {
                ProviderConfig::Appwrite(AppwriteConfig {
                    api_key: saved.api_key.clone().or_else(|| live.api_key.clone()),
                    ..saved.clone()
                })
            }
            (ProviderConfig::Http(saved), ProviderConfig::Http(live)) => {
                let mut secret_headers = live.secret_headers.clone();
                secret_headers.extend(saved.secret_headers.clone());
                ProviderConfig::Http(HttpProviderConfig {
                    secret_headers,
                    ..saved.clone()
                })
            }
            (
                ProviderConfig::Other { name, settings },
                ProviderConfig::Other {
                    name: live_name,
                    settings: live_settings,
                },
            ) if name == live_name => {
                let mut merged = settings.clone();
                for (k, v) in live_settings {
                    if is_secret_key(k) {
                        merged.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                ProviderConfig::Other {
                    name: name.clone(),
                    settings: merged,
                }
            }
            _ => self.clone(),
        }
    }

    /// Fill a missing API key from `TIDYRUN_PROVIDER_API_KEY`.
    pub fn with_env_secrets(self) -> Self {
        match self {
            ProviderConfig::Appwrite(mut cfg) if cfg.api_key.is_none() => {
                cfg.api_key = std::env::var(PROVIDER_API_KEY_ENV).ok();
                ProviderConfig::Appwrite(cfg)
            }
            other => other,
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["key", "secret", "token", "password"]
        .iter()
        .any(|needle| key.contains(needle))
}

/// Appwrite provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppwriteConfig {
    pub endpoint: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Default database for `row` resources without a `databaseId`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_id: Option<String>,
}

/// Generic REST provider settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub endpoint: String,

    /// Non-secret headers sent with every request
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Headers never persisted (credentials)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_headers: BTreeMap<String, String>,

    /// Resource type -> path template, e.g. `row: /rows/${id}`
    #[serde(default)]
    pub paths: BTreeMap<String, String>,

    /// Listing endpoints used by the untracked scan
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scan: Vec<ScanSource>,
}

/// A listing endpoint the untracked scan can read candidates from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSource {
    pub resource_type: String,
    pub list_path: String,
    /// JSON pointer to the item array in the response (`""` = the body itself)
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_created_field")]
    pub created_field: String,
    #[serde(default = "default_permissions_field")]
    pub permissions_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_created_field() -> String {
    "createdAt".to_string()
}

fn default_permissions_field() -> String {
    "permissions".to_string()
}

// ============================================================================
// Global configuration
// ============================================================================

/// Contents of `tidyrun.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub run: RunSection,

    #[serde(default)]
    pub tracking: TrackingSection,

    /// New-style cleanup block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<CleanupConfig>,

    /// Legacy provider block that may carry `cleanup = true`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appwrite: Option<LegacyAppwriteSection>,
}

impl GlobalConfig {
    /// Load configuration from file; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Load `tidyrun.toml` from a directory.
    pub fn discover(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(CONFIG_FILE_NAME))
    }

    /// Cleanup section to use when nothing more specific is given.
    pub fn effective_cleanup(&self) -> Option<CleanupConfig> {
        infer_cleanup(self.cleanup.as_ref(), self.appwrite.as_ref())
    }

    /// State directory, honouring `[run] state_dir`.
    pub fn state_dir(&self) -> PathBuf {
        self.run
            .state_dir
            .clone()
            .unwrap_or_else(crate::default_state_dir)
    }

    pub fn failed_cleanup_dir(&self) -> PathBuf {
        self.state_dir().join("failed-cleanups")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir().join("sessions")
    }
}

/// Dev/preview server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Readiness URL; no URL means no server is managed
    #[serde(default)]
    pub url: Option<String>,
    /// Explicit start command
    #[serde(default)]
    pub command: Option<String>,
    /// Serve this directory instead of running a command
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
    /// Working directory for the command
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub reuse_existing: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_stall_timeout() -> u64 {
    30
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            url: None,
            command: None,
            static_dir: None,
            cwd: None,
            reuse_existing: true,
            startup_timeout_secs: default_startup_timeout(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

/// Execution defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(default = "default_true")]
    pub cleanup_on_failure: bool,
    #[serde(default = "default_step_timeout")]
    pub step_timeout_ms: u64,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// External step driver command
    #[serde(default)]
    pub driver: Option<String>,
}

fn default_step_timeout() -> u64 {
    30_000
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            continue_on_failure: false,
            cleanup_on_failure: true,
            step_timeout_ms: default_step_timeout(),
            state_dir: None,
            driver: None,
        }
    }
}

/// Resource-reporting channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Port for the `/track` endpoint (0 = any free port)
    #[serde(default)]
    pub port: u16,
    /// Append-only report file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for TrackingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 0,
            file: None,
        }
    }
}

/// Legacy `[appwrite]` block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyAppwriteSection {
    pub endpoint: String,
    pub project_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub cleanup_parallel: bool,
    #[serde(default)]
    pub cleanup_retries: Option<u32>,
    #[serde(default)]
    pub scan_untracked: bool,
}

/// Infer the cleanup configuration from the new-style block, falling back
/// to the legacy `appwrite.cleanup` switch.
pub fn infer_cleanup(
    cleanup: Option<&CleanupConfig>,
    legacy: Option<&LegacyAppwriteSection>,
) -> Option<CleanupConfig> {
    if let Some(cleanup) = cleanup {
        return Some(cleanup.clone());
    }
    let legacy = legacy.filter(|l| l.cleanup)?;
    Some(CleanupConfig {
        provider: "appwrite".to_string(),
        parallel: legacy.cleanup_parallel,
        retries: legacy.cleanup_retries.unwrap_or(DEFAULT_RETRIES),
        scan_untracked: legacy.scan_untracked,
        appwrite: Some(AppwriteConfig {
            endpoint: legacy.endpoint.clone(),
            project_id: legacy.project_id.clone(),
            api_key: legacy.api_key.clone(),
            database_id: legacy.database_id.clone(),
        }),
        ..CleanupConfig::default()
    })
}

// ============================================================================
// Layering
// ============================================================================

/// Section layering: the most specific layer that is present wins outright.
#[derive(Debug, Clone)]
pub struct Layered<T> {
    global: Option<T>,
    pipeline: Option<T>,
    workflow: Option<T>,
    test: Option<T>,
}

impl<T: Clone> Layered<T> {
    pub fn new(global: Option<T>) -> Self {
        Self {
            global,
            pipeline: None,
            workflow: None,
            test: None,
        }
    }

    pub fn pipeline(mut self, section: Option<T>) -> Self {
        self.pipeline = section;
        self
    }

    pub fn workflow(mut self, section: Option<T>) -> Self {
        self.workflow = section;
        self
    }

    pub fn test(mut self, section: Option<T>) -> Self {
        self.test = section;
        self
    }

    pub fn resolve(&self) -> Option<T> {
        self.test
            .as_ref()
            .or(self.workflow.as_ref())
            .or(self.pipeline.as_ref())
            .or(self.global.as_ref())
            .cloned()
    }
}
