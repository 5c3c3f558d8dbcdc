/// Logging setup and structured failure helpers.
///
/// `init_logger` installs a `tracing` subscriber that writes to the
/// console and, when a file prefix is configured, to
/// `<prefix><YYYYMMDD-HHMMSS>.log` as well. Modules log through the
/// `tracing` macros; the helpers here classify feed failures and summarize
/// multi-fetch runs.

use std::fmt;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::filter::{EnvFilter, ParseError};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};

use crate::config::LoggingConfig;
use crate::model::FeedError;

/// Modules raised to DEBUG in verbose mode.
const VERBOSE_TARGETS: [&str; 3] = ["buoy_service::store", "buoy_service::ingest", "buoy_service::table"];

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("could not create log file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("logger already initialized: {0}")]
    Init(#[from] TryInitError),
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Filter directives for a configuration, e.g. `info` or
/// `info,buoy_service::store=debug,...` when verbose.
pub fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.level.clone();
    if config.verbose {
        for target in VERBOSE_TARGETS {
            directives.push_str(&format!(",{}=debug", target));
        }
    }
    directives
}

/// `<prefix><YYYYMMDD-HHMMSS>.log`
pub fn log_file_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{}{}.log", prefix, Utc::now().format("%Y%m%d-%H%M%S")))
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces the
/// configured filter. Returns the log file path, if any.
pub fn init_logger(config: &LoggingConfig) -> Result<Option<PathBuf>, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(config))?,
    };

    let (file_layer, path) = match &config.file_prefix {
        Some(prefix) => {
            let path = log_file_path(prefix);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(&path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()?;

    if let Some(path) = &path {
        info!("logging to {}", path.display());
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// The feed has no file for the requested period (not yet published,
    /// or the buoy was offline).
    Expected,
    /// Service degradation or a bad request.
    Unexpected,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
        }
    }
}

pub fn classify_feed_failure(err: &FeedError) -> FailureType {
    match err {
        FeedError::HttpStatus { status: 404, .. } => FailureType::Expected,
        _ => FailureType::Unexpected,
    }
}

/// Logs a feed failure at a level matching its classification.
pub fn log_feed_failure(buoy: &str, operation: &str, err: &FeedError) -> FailureType {
    let failure_type = classify_feed_failure(err);
    match failure_type {
        FailureType::Expected => {
            debug!(buoy, "{} failed [{}]: {}", operation, failure_type, err)
        }
        FailureType::Unexpected => {
            error!(buoy, "{} failed [{}]: {}", operation, failure_type, err)
        }
    }
    failure_type
}

// ---------------------------------------------------------------------------
// Backfill Summary Logging
// ---------------------------------------------------------------------------

/// Logs a summary of a multi-period backfill.
pub fn log_backfill_summary(label: &str, total: usize, successful: usize, failed: usize) {
    let message = format!(
        "{} backfill complete: {}/{} successful, {} failed",
        label, successful, total, failed
    );

    if failed == 0 {
        info!("{}", message);
    } else if successful == 0 {
        error!("{}", message);
    } else {
        warn!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_store_and_ingest() {
        let mut config = LoggingConfig::default();
        assert_eq!(filter_directives(&config), "info");

        config.verbose = true;
        let directives = filter_directives(&config);
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("buoy_service::store=debug"));
        assert!(directives.contains("buoy_service::ingest=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn test_log_file_name_has_timestamp() {
        let path = log_file_path("logs/buoy-");
        let name = path.to_string_lossy().into_owned();
        assert!(name.starts_with("logs/buoy-"));
        assert!(name.ends_with(".log"));
        // logs/buoy- + YYYYMMDD-HHMMSS + .log
        assert_eq!(name.len(), "logs/buoy-".len() + 15 + 4);
    }

    #[test]
    fn test_failure_classification() {
        let missing = FeedError::HttpStatus {
            status: 404,
            url: "https://www.ndbc.noaa.gov/data/stdmet/Jan/46013.txt".to_string(),
        };
        assert_eq!(classify_feed_failure(&missing), FailureType::Expected);

        let unavailable = FeedError::HttpStatus {
            status: 503,
            url: "https://www.ndbc.noaa.gov/data/5day2/46013_5day.txt".to_string(),
        };
        assert_eq!(classify_feed_failure(&unavailable), FailureType::Unexpected);
    }
}
