//! Engine configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.geotorget/
//!   config.yaml     (optional; every field has a default)
//! ```
//!
//! Like the Manifest Store, every function that touches the filesystem has an
//! `_at(home)` form used by tests and a convenience form that resolves the
//! home directory with `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::types::OrderId;

pub const DEFAULT_BASE_URL: &str = "https://download-geotorget.lantmateriet.se/download";
pub const DEFAULT_PARALLELISM: usize = 4;

/// Environment variable overriding [`EngineConfig::output_root`].
pub const ENV_OUTPUT_DIR: &str = "GEOTORGET_OUTPUT_DIR";
/// Environment variable overriding [`EngineConfig::base_url`].
pub const ENV_BASE_URL: &str = "GEOTORGET_BASE_URL";

/// How batch update checks choose which orders to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckScope {
    /// Orders that are both subscribed and present locally.
    Intersect,
    /// Orders that are subscribed or present locally.
    #[default]
    Union,
}

/// Retry policy for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetrySettings {
    /// Delay before attempt `attempt + 1`, where `attempt` is the 1-based
    /// number of the attempt that just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub output_root: PathBuf,
    pub parallelism: usize,
    pub base_url: String,
    /// Timeout for file body requests. Listing requests use a fixed 30 s.
    pub request_timeout_secs: u64,
    pub subscriptions: Vec<OrderId>,
    pub subscriptions_url: Option<String>,
    pub check_scope: CheckScope,
    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_root: default_output_root(),
            parallelism: DEFAULT_PARALLELISM,
            base_url: DEFAULT_BASE_URL.to_owned(),
            request_timeout_secs: 300,
            subscriptions: Vec::new(),
            subscriptions_url: None,
            check_scope: CheckScope::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl EngineConfig {
    /// Parallelism clamped to at least one worker.
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    /// Apply `GEOTORGET_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            self.output_root = PathBuf::from(dir);
        }
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = url;
        }
    }
}

fn default_output_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
        .join("geotorget")
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// `<home>/.geotorget/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    home.join(".geotorget").join("config.yaml")
}

/// Load the config file under `home`, falling back to defaults when absent.
pub fn load_at(home: &Path) -> Result<EngineConfig, StoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
        path,
        reason: e.to_string(),
    })
}

/// `load_at` convenience wrapper, with environment overrides applied.
pub fn load() -> Result<EngineConfig, StoreError> {
    let mut config = load_at(&home()?)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Write `config` to `<home>/.geotorget/config.yaml` unless a file is already there.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `rename`.
pub fn init_at(home: &Path, config: &EngineConfig) -> Result<PathBuf, StoreError> {
    let path = config_path_at(home);
    if path.exists() {
        return Err(StoreError::ConfigExists { path });
    }
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid config path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let yaml = render(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(path)
}

/// `init_at` convenience wrapper.
pub fn init(config: &EngineConfig) -> Result<PathBuf, StoreError> {
    init_at(&home()?, config)
}

/// `config_path_at` for the current user's home directory.
pub fn config_path() -> Result<PathBuf, StoreError> {
    Ok(config_path_at(&home()?))
}

/// YAML text of `config` as `init` writes it.
pub fn render(config: &EngineConfig) -> Result<String, StoreError> {
    Ok(serde_yaml::to_string(config)?)
}

fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}
