/// Service configuration.
///
/// Sources, lowest to highest priority:
/// 1. built-in defaults
/// 2. a TOML file, from `--config` or `BUOY_CONFIG`
/// 3. environment variables, after `.env` has been loaded
///
/// ```toml
/// buoy = "46013"
/// database_url = "postgres://buoy@localhost/buoy"
///
/// [table]
/// name = "buoy_observations"
/// index_suffix = "/period-index"
///
/// [feed]
/// base_url = "https://www.ndbc.noaa.gov"
/// timeout_secs = 30
///
/// [batch]
/// chunk_size = 25
/// first_backoff_ms = 100
/// max_backoff_ms = 5000
/// max_attempts = 20
///
/// [report]
/// time_zone = "America/Los_Angeles"
///
/// [logging]
/// level = "info"
/// file_prefix = "logs/buoy-"
/// verbose = false
/// ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;
use thiserror::Error;

use crate::ingest::ndbc::NDBC_BASE_URL;
use crate::model::is_valid_buoy_id;
use crate::store::MAX_BATCH_SIZE;
use crate::store::batch::BackoffPolicy;
use crate::store::pg::is_plain_identifier;
use crate::table::DEFAULT_INDEX_SUFFIX;

pub const ENV_CONFIG: &str = "BUOY_CONFIG";
pub const ENV_BUOY: &str = "BUOY_ID";
pub const ENV_TABLE: &str = "BUOY_TABLE";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_LOG_PREFIX: &str = "BUOY_LOG_PREFIX";
pub const ENV_TIME_ZONE: &str = "BUOY_TIME_ZONE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub buoy: String,
    pub database_url: Option<String>,
    pub table: TableConfig,
    pub feed: FeedConfig,
    pub batch: BatchConfig,
    pub report: ReportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    pub index_suffix: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeedConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub first_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Unset means retry until the store accepts everything.
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
    /// IANA zone name for times in the summary paragraph.
    pub time_zone: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file_prefix: Option<String>,
    pub verbose: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            buoy: "46013".to_string(),
            database_url: None,
            table: TableConfig::default(),
            feed: FeedConfig::default(),
            batch: BatchConfig::default(),
            report: ReportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            name: "buoy_observations".to_string(),
            index_suffix: DEFAULT_INDEX_SUFFIX.to_string(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            base_url: NDBC_BASE_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            chunk_size: MAX_BATCH_SIZE,
            first_backoff_ms: 100,
            max_backoff_ms: 5000,
            max_attempts: None,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            time_zone: "America/Los_Angeles".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            file_prefix: None,
            verbose: false,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BatchConfig {
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl ReportConfig {
    pub fn zone(&self) -> Result<Tz, ConfigError> {
        self.time_zone
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown time zone '{}'", self.time_zone)))
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Where environment overrides come from. Tests supply a map.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl ServiceConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        ServiceConfig::from_toml_str(&content, path)
    }

    /// Loads `.env`, then the config file if one is named, then applies
    /// environment overrides and validates.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        ServiceConfig::load_with(explicit_path, &ProcessEnv)
    }

    pub fn load_with(explicit_path: Option<&Path>, env: &dyn EnvSource) -> Result<Self, ConfigError> {
        let path = explicit_path
            .map(Path::to_path_buf)
            .or_else(|| env.get(ENV_CONFIG).map(PathBuf::from));
        let mut config = match path {
            Some(path) => ServiceConfig::from_file(&path)?,
            None => ServiceConfig::default(),
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, env: &dyn EnvSource) {
        if let Some(buoy) = env.get(ENV_BUOY) {
            self.buoy = buoy;
        }
        if let Some(table) = env.get(ENV_TABLE) {
            self.table.name = table;
        }
        if let Some(url) = env.get(ENV_DATABASE_URL) {
            self.database_url = Some(url);
        }
        if let Some(prefix) = env.get(ENV_LOG_PREFIX) {
            self.logging.file_prefix = Some(prefix);
        }
        if let Some(zone) = env.get(ENV_TIME_ZONE) {
            self.report.time_zone = zone;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_buoy_id(&self.buoy) {
            return Err(ConfigError::Invalid(format!(
                "buoy id '{}' is not a 5-character station id",
                self.buoy
            )));
        }
        if !is_plain_identifier(&self.table.name) {
            return Err(ConfigError::Invalid(format!(
                "table name '{}' must be a lowercase identifier",
                self.table.name
            )));
        }
        if self.table.index_suffix.is_empty() {
            return Err(ConfigError::Invalid("index_suffix must not be empty".to_string()));
        }
        let batch = &self.batch;
        if !(1..=MAX_BATCH_SIZE).contains(&batch.chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} outside 1..={}",
                batch.chunk_size, MAX_BATCH_SIZE
            )));
        }
        if batch.first_backoff_ms == 0 {
            return Err(ConfigError::Invalid("first_backoff_ms must be positive".to_string()));
        }
        if batch.max_backoff_ms < batch.first_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "max_backoff_ms {} is below first_backoff_ms {}",
                batch.max_backoff_ms, batch.first_backoff_ms
            )));
        }
        if batch.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".to_string()));
        }
        self.report.zone()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
