//! Application configuration for the importer.
//!
//! User config lives at `~/.multistep-importer/importer.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "importer.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".multistep-importer";

/// Longest accepted time between periodic imports (one year).
pub const MAX_IMPORT_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Config structs (matching importer.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduling and stage concurrency.
    #[serde(default)]
    pub job: JobSection,

    /// Behaviour of the simulated supplier source.
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// `[job]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    /// Seconds between periodic imports.
    #[serde(default = "default_import_interval_secs")]
    pub import_interval_secs: u64,

    /// Maximum downloads in flight within one run.
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Maximum parses in flight within one run.
    #[serde(default = "default_max_concurrent_parsings")]
    pub max_concurrent_parsings: usize,

    /// Per-download time limit. Absent means no limit.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: Option<u64>,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            import_interval_secs: default_import_interval_secs(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_parsings: default_max_concurrent_parsings(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_import_interval_secs() -> u64 {
    60
}
fn default_max_concurrent_downloads() -> usize {
    5
}
fn default_max_concurrent_parsings() -> usize {
    3
}
fn default_download_timeout_secs() -> Option<u64> {
    Some(30)
}

/// `[simulation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Number of suppliers returned by each fetch.
    #[serde(default = "default_supplier_count")]
    pub supplier_count: u32,

    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,

    #[serde(default = "default_parse_delay_ms")]
    pub parse_delay_ms: u64,

    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,

    /// Suppliers whose files fail to parse.
    #[serde(default)]
    pub failing_suppliers: Vec<u32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            supplier_count: default_supplier_count(),
            download_delay_ms: default_download_delay_ms(),
            parse_delay_ms: default_parse_delay_ms(),
            save_delay_ms: default_save_delay_ms(),
            failing_suppliers: Vec::new(),
        }
    }
}

fn default_supplier_count() -> u32 {
    7
}
fn default_download_delay_ms() -> u64 {
    1500
}
fn default_parse_delay_ms() -> u64 {
    1000
}
fn default_save_delay_ms() -> u64 {
    200
}

// ---------------------------------------------------------------------------
// Job config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Validated runtime configuration of the background job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    /// Time between periodic runs.
    pub import_interval: Duration,
    /// Download concurrency within one run (at least 1).
    pub max_concurrent_downloads: usize,
    /// Parse concurrency within one run (at least 1).
    pub max_concurrent_parsings: usize,
    /// Per-download time limit.
    pub download_timeout: Option<Duration>,
}

impl JobConfig {
    pub fn new(
        import_interval: Duration,
        max_concurrent_downloads: usize,
        max_concurrent_parsings: usize,
    ) -> Result<Self> {
        let config = Self {
            import_interval,
            max_concurrent_downloads,
            max_concurrent_parsings,
            download_timeout: None,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = Some(timeout);
        self
    }

    /// Check the invariants the scheduler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.import_interval.is_zero() {
            return Err(ImportError::config("import_interval must be greater than zero"));
        }
        if self.import_interval > MAX_IMPORT_INTERVAL {
            return Err(ImportError::config(format!(
                "import_interval must be at most {}s",
                MAX_IMPORT_INTERVAL.as_secs()
            )));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(ImportError::config(
                "max_concurrent_downloads must be at least 1",
            ));
        }
        if self.max_concurrent_parsings == 0 {
            return Err(ImportError::config(
                "max_concurrent_parsings must be at least 1",
            ));
        }
        if self.download_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ImportError::config("download_timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            import_interval: Duration::from_secs(default_import_interval_secs()),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_parsings: default_max_concurrent_parsings(),
            download_timeout: default_download_timeout_secs().map(Duration::from_secs),
        }
    }
}

impl TryFrom<&AppConfig> for JobConfig {
    type Error = ImportError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let job = &config.job;
        let runtime = Self {
            import_interval: Duration::from_secs(job.import_interval_secs),
            max_concurrent_downloads: job.max_concurrent_downloads,
            max_concurrent_parsings: job.max_concurrent_parsings,
            download_timeout: job.download_timeout_secs.map(Duration::from_secs),
        };
        runtime.validate()?;
        Ok(runtime)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.multistep-importer/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ImportError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.multistep-importer/importer.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ImportError::fs(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ImportError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ImportError::fs(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| ImportError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ImportError::fs(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
