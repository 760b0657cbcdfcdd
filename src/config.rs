//! Configuration for scanpipe.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SCANPIPE_HOME, SCANPIPE_DB)
//! 2. Config file (.scanpipe/config.yaml)
//! 3. Defaults (~/.scanpipe)
//!
//! Config file discovery:
//! - Searches current directory and parents for .scanpipe/config.yaml
//! - Paths in config file are relative to the .scanpipe/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::NominatimConfig;
use crate::core::Backoff;
use crate::domain::{RetentionPolicy, DEFAULT_MAX_RETRIES};
use crate::store::DEFAULT_BUSY_TIMEOUT;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const CONFIG_DIR: &str = ".scanpipe";
const DATABASE_FILE: &str = "scanpipe.db";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub version: Option<String>,
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub reclaimer: ReclaimerConfig,
    pub backoff: Backoff,
    pub schedule: ScheduleConfig,
    /// Per-table overrides merged over the built-in policies
    pub retention: BTreeMap<String, RetentionEntry>,
    pub geocode: GeocodeConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .scanpipe/)
    pub home: Option<String>,
    /// Database file (relative to .scanpipe/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retry budget given to new records
    pub max_retries: u32,
    /// Records a stage runner picks up per turn
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReclaimerConfig {
    pub stuck_after_hours: u32,
    pub resurrect_after_days: u32,
    pub stalled_download_minutes: u32,
    /// Resurrect exhausted records from the scheduler, not only by hand
    pub auto_resurrect: bool,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            stuck_after_hours: 24,
            resurrect_after_days: 7,
            stalled_download_minutes: 10,
            auto_resurrect: true,
        }
    }
}

impl ReclaimerConfig {
    pub fn stalled_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stalled_download_minutes))
    }
}

/// Seconds between scheduled job turns
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub partitions_secs: u64,
    pub reclaimer_secs: u64,
    pub retention_secs: u64,
    pub stats_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            partitions_secs: 86_400,
            reclaimer_secs: 300,
            retention_secs: 86_400,
            stats_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetentionEntry {
    pub days: u32,
    pub column: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub ttl_days: u32,
    pub nominatim_url: String,
    pub user_agent: String,
    pub rate_limit_per_second: f64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        let nominatim = NominatimConfig::default();
        Self {
            ttl_days: 90,
            nominatim_url: nominatim.base_url,
            user_agent: nominatim.user_agent,
            rate_limit_per_second: nominatim.rate_limit,
        }
    }
}

impl GeocodeConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.ttl_days))
    }

    pub fn nominatim(&self) -> NominatimConfig {
        NominatimConfig {
            base_url: self.nominatim_url.clone(),
            user_agent: self.user_agent.clone(),
            rate_limit: self.rate_limit_per_second,
        }
    }
}

/// Built-in retention policies
pub fn default_retention() -> BTreeMap<String, RetentionEntry> {
    [
        ("calls", 365, "started_at"),
        ("api_call_metrics", 30, "recorded_at"),
        ("system_logs", 14, "logged_at"),
        ("state_transitions", 30, "at"),
        ("geocode_cache", 0, "expires_at"),
    ]
    .into_iter()
    .map(|(table, days, column)| {
        (
            table.to_string(),
            RetentionEntry {
                days,
                column: column.to_string(),
                enabled: true,
            },
        )
    })
    .collect()
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub database: DatabaseConfig,
    pub pipeline: PipelineConfig,
    pub reclaimer: ReclaimerConfig,
    pub backoff: Backoff,
    pub schedule: ScheduleConfig,
    pub retention: BTreeMap<String, RetentionEntry>,
    pub geocode: GeocodeConfig,
}

impl ResolvedConfig {
    /// Retention policies to seed, built-ins overridden by the config file
    pub fn retention_policies(&self) -> Vec<RetentionPolicy> {
        self.retention
            .iter()
            .map(|(table, entry)| RetentionPolicy {
                enabled: entry.enabled,
                ..RetentionPolicy::new(table, entry.days, &entry.column)
            })
            .collect()
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

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    load_config_from(find_config_file())
}

fn load_config_from(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Ok(env_home) = std::env::var("SCANPIPE_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(_)) = (&file.paths.home, &config_file) {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let database_path = if let Ok(env_db) = std::env::var("SCANPIPE_DB") {
        PathBuf::from(env_db)
    } else if let (Some(db_path), Some(_)) = (&file.paths.database, &config_file) {
        resolve_path(config_dir, db_path)
    } else {
        home.join(DATABASE_FILE)
    };

    let mut retention = default_retention();
    retention.extend(file.retention);

    Ok(ResolvedConfig {
        home,
        database_path,
        config_file,
        database: file.database,
        pipeline: file.pipeline,
        reclaimer: file.reclaimer,
        backoff: file.backoff,
        schedule: file.schedule,
        retention,
        geocode: file.geocode,
    })
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

/// Get the scanpipe home directory
pub fn scanpipe_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the database file path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database_path.clone())
}
