//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::WorkerConfig;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub max_connections: u32,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Where raw uploads are stored, one directory per work.
    pub upload_dir: PathBuf,
    /// pgmq queue carrying task ids.
    pub queue_name: String,
    /// Key of the shared token counter.
    pub token_key: String,
    /// Overrides the memory-derived capacity hint at pool initialization.
    pub token_capacity: Option<i64>,
    /// Program run for each task (the scraper).
    pub scraper_command: Option<PathBuf>,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let defaults = WorkerConfig::default();
        let config = Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            max_connections: parsed_var("DB_MAX_CONNECTIONS")?.unwrap_or(10),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            queue_name: std::env::var("QUEUE_NAME")
                .unwrap_or_else(|_| crate::queue::DEFAULT_QUEUE.to_string()),
            token_key: std::env::var("TOKEN_KEY")
                .unwrap_or_else(|_| crate::tokens::DEFAULT_TOKEN_KEY.to_string()),
            token_capacity: parsed_var("TOKEN_CAPACITY")?,
            scraper_command: std::env::var("SCRAPER_COMMAND").ok().map(PathBuf::from),
            worker: WorkerConfig {
                admission_backoff: seconds_var("ADMISSION_BACKOFF_SECS")?
                    .unwrap_or(defaults.admission_backoff),
                retry_delay: seconds_var("RETRY_DELAY_SECS")?.unwrap_or(defaults.retry_delay),
                max_retries: parsed_var("MAX_RETRIES")?.unwrap_or(defaults.max_retries),
                job_timeout: seconds_var("JOB_TIMEOUT_SECS")?.unwrap_or(defaults.job_timeout),
                visibility_timeout: seconds_var("VISIBILITY_TIMEOUT_SECS")?
                    .unwrap_or(defaults.visibility_timeout),
                prefetch: parsed_var("WORKER_PREFETCH")?.unwrap_or(defaults.prefetch),
                ..defaults
            },
        };
        config.worker.validate()?;
        // pgmq takes whole seconds; the heartbeat runs at half the window.
        if config.worker.visibility_timeout < MIN_VISIBILITY_TIMEOUT {
            return Err(Error::Config(format!(
                "VISIBILITY_TIMEOUT_SECS must be at least {}",
                MIN_VISIBILITY_TIMEOUT.as_secs()
            )));
        }
        Ok(config)
    }
}

const MIN_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(2);

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn seconds_var(name: &str) -> Result<Option<Duration>> {
    Ok(parsed_var::<u64>(name)?.map(Duration::from_secs))
}
