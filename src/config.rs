//! Configuration for arkmongo.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ARKMONGO_HOME, ARKMONGO_DOCUMENTS,
//!    ARKMONGO_LEDGER_ENDPOINT, ARKMONGO_DERIVATION_KEY)
//! 2. Config file (.arkmongo/config.yaml)
//! 3. Defaults (~/.arkmongo)
//!
//! Config file discovery:
//! - Searches current directory and parents for .arkmongo/config.yaml
//! - `paths.home` is relative to the .arkmongo/ directory, `paths.documents`
//!   to the project root containing it

pub mod paths;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{AnchorSettings, RetryPolicy, DEFAULT_BUSY_TIMEOUT, DEFAULT_DERIVATION_KEY};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".arkmongo";
const DEFAULT_LEDGER_ENDPOINT: &str = "http://127.0.0.1:4003/api";
const DEFAULT_NETWORK_PREFIX: u8 = 0x17;
const DEFAULT_AMOUNT: u64 = 1;
const DEFAULT_SUBMIT_TIMEOUT_SECONDS: u64 = 30;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub index: Option<IndexConfig>,
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory holding the index (relative to .arkmongo/)
    pub home: Option<String>,
    /// Root of the JSONL document stores (relative to project root)
    pub documents: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexConfig {
    pub busy_timeout_ms: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub endpoint: Option<String>,
    pub network_prefix: Option<u8>,
    pub amount: Option<u64>,
    pub submit_timeout_seconds: Option<u64>,
    pub derivation_key: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to arkmongo home (index state)
    pub home: PathBuf,
    /// Root directory of the document stores
    pub documents: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Index settings
    pub index: IndexSettings,
    /// Ledger settings
    pub ledger: LedgerSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub busy_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct LedgerSettings {
    pub endpoint: String,
    pub network_prefix: u8,
    pub amount: u64,
    pub submit_timeout: Duration,
    pub derivation_key: String,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LEDGER_ENDPOINT.to_string(),
            network_prefix: DEFAULT_NETWORK_PREFIX,
            amount: DEFAULT_AMOUNT,
            submit_timeout: Duration::from_secs(DEFAULT_SUBMIT_TIMEOUT_SECONDS),
            derivation_key: DEFAULT_DERIVATION_KEY.to_string(),
        }
    }
}

impl fmt::Debug for LedgerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerSettings")
            .field("endpoint", &self.endpoint)
            .field("network_prefix", &self.network_prefix)
            .field("amount", &self.amount)
            .field("submit_timeout", &self.submit_timeout)
            .field("derivation_key", &"<redacted>")
            .finish()
    }
}

impl LedgerSettings {
    /// Whether the built-in derivation key is in use
    pub fn uses_default_key(&self) -> bool {
        self.derivation_key == DEFAULT_DERIVATION_KEY
    }
}

impl ResolvedConfig {
    /// Orchestrator settings derived from this configuration
    pub fn anchor_settings(&self) -> AnchorSettings {
        AnchorSettings {
            amount: self.ledger.amount,
            submit_timeout: Some(self.ledger.submit_timeout),
            store_retry: self.index.retry.clone(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge defaults, an optional config file and environment overrides
fn resolve(
    default_home: PathBuf,
    config_path: Option<&Path>,
    file: Option<ConfigFile>,
    env: impl Fn(&str) -> Option<String>,
) -> ResolvedConfig {
    let (paths, index, ledger) = match file {
        Some(file) => (file.paths, file.index, file.ledger),
        None => (PathsConfig::default(), None, None),
    };

    // .arkmongo/ and the project root above it
    let config_dir = config_path.and_then(Path::parent);
    let base_dir = config_dir.and_then(Path::parent);

    let home = if let Some(env_home) = env("ARKMONGO_HOME") {
        PathBuf::from(env_home)
    } else {
        match (config_dir, paths.home.as_deref()) {
            (Some(dir), Some(home_path)) => resolve_path(dir, home_path),
            _ => default_home,
        }
    };

    let documents = if let Some(env_docs) = env("ARKMONGO_DOCUMENTS") {
        PathBuf::from(env_docs)
    } else {
        match (base_dir, paths.documents.as_deref()) {
            (Some(dir), Some(docs_path)) => resolve_path(dir, docs_path),
            _ => home.join("documents"),
        }
    };

    let index = match index {
        Some(index) => IndexSettings {
            busy_timeout: index
                .busy_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BUSY_TIMEOUT),
            retry: index.retry.unwrap_or_default(),
        },
        None => IndexSettings::default(),
    };

    let mut ledger_settings = LedgerSettings::default();
    if let Some(ledger) = ledger {
        if let Some(endpoint) = ledger.endpoint {
            ledger_settings.endpoint = endpoint;
        }
        if let Some(prefix) = ledger.network_prefix {
            ledger_settings.network_prefix = prefix;
        }
        if let Some(amount) = ledger.amount {
            ledger_settings.amount = amount;
        }
        if let Some(seconds) = ledger.submit_timeout_seconds {
            ledger_settings.submit_timeout = Duration::from_secs(seconds);
        }
        if let Some(key) = ledger.derivation_key {
            ledger_settings.derivation_key = key;
        }
    }
    if let Some(endpoint) = env("ARKMONGO_LEDGER_ENDPOINT") {
        ledger_settings.endpoint = endpoint;
    }
    if let Some(key) = env("ARKMONGO_DERIVATION_KEY") {
        ledger_settings.derivation_key = key;
    }

    ResolvedConfig {
        home,
        documents,
        config_file: config_path.map(Path::to_path_buf),
        index,
        ledger: ledger_settings,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let config_path = find_config_file();
    let file = match config_path.as_deref() {
        Some(path) => Some(load_config_file(path)?),
        None => None,
    };

    Ok(resolve(default_home, config_path.as_deref(), file, |key| {
        std::env::var(key).ok()
    }))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
