use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const DEFAULT_PAGE_SIZE: u64 = 100;
const DEFAULT_PERIODIC_SECS: u64 = 300;
const DEFAULT_MIN_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_PUSH_INTERVAL_SECS: u64 = 30;
const DEFAULT_COVER_INTERVAL_SECS: u64 = 60;
const DEFAULT_COVER_BATCH: u64 = 20;
const DEFAULT_COVER_CONCURRENCY: u64 = 4;
const DEFAULT_COVER_MAX_ATTEMPTS: u64 = 5;
const DEFAULT_CLOCK_SKEW_MS: u64 = 2_000;
const DEFAULT_REALTIME_MAX_ATTEMPTS: u64 = 8;
const DEFAULT_REALTIME_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_REALTIME_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_PUSH_MAX_AUTO_RETRIES: u64 = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid server url {url:?}: {source}")]
    InvalidServerUrl {
        url: String,
        source: url::ParseError,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncConfig {
    pub server_url: String,
    pub database_path: PathBuf,
    pub cover_dir: PathBuf,
    pub page_size: u32,
    pub periodic_interval: Duration,
    /// Periodic cycles are skipped while the last success is younger than this.
    pub min_sync_interval: Duration,
    pub push_interval: Duration,
    pub cover_interval: Duration,
    pub cover_batch_size: u32,
    pub cover_concurrency: usize,
    pub cover_max_attempts: u32,
    pub clock_skew: Duration,
    pub realtime_max_attempts: u32,
    pub realtime_backoff_base: Duration,
    pub realtime_backoff_max: Duration,
    pub push_max_auto_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            database_path: default_database_path(),
            cover_dir: default_cover_dir(),
            page_size: DEFAULT_PAGE_SIZE as u32,
            periodic_interval: Duration::from_secs(DEFAULT_PERIODIC_SECS),
            min_sync_interval: Duration::from_secs(DEFAULT_MIN_SYNC_INTERVAL_SECS),
            push_interval: Duration::from_secs(DEFAULT_PUSH_INTERVAL_SECS),
            cover_interval: Duration::from_secs(DEFAULT_COVER_INTERVAL_SECS),
            cover_batch_size: DEFAULT_COVER_BATCH as u32,
            cover_concurrency: DEFAULT_COVER_CONCURRENCY as usize,
            cover_max_attempts: DEFAULT_COVER_MAX_ATTEMPTS as u32,
            clock_skew: Duration::from_millis(DEFAULT_CLOCK_SKEW_MS),
            realtime_max_attempts: DEFAULT_REALTIME_MAX_ATTEMPTS as u32,
            realtime_backoff_base: Duration::from_millis(DEFAULT_REALTIME_BACKOFF_BASE_MS),
            realtime_backoff_max: Duration::from_millis(DEFAULT_REALTIME_BACKOFF_MAX_MS),
            push_max_auto_retries: DEFAULT_PUSH_MAX_AUTO_RETRIES as u32,
        }
    }
}

impl SyncConfig {
    /// Reads `AUDIOSHELF_*` variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir();
        Self::from_lookup(|name| std::env::var(name).ok(), home.as_deref())
    }

    fn from_lookup<F>(lookup: F, home: Option<&Path>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str, default: u64| read_u64(lookup(name), default);
        let path = |name: &str, default: PathBuf| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .map(|value| expand_with_home(&value, home))
                .unwrap_or(default)
        };

        let server_url = lookup("AUDIOSHELF_SERVER_URL")
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        Url::parse(&server_url).map_err(|source| ConfigError::InvalidServerUrl {
            url: server_url.clone(),
            source,
        })?;

        Ok(Self {
            server_url,
            database_path: path("AUDIOSHELF_DB_PATH", default_database_path()),
            cover_dir: path("AUDIOSHELF_COVER_DIR", default_cover_dir()),
            page_size: clamp_u32(number("AUDIOSHELF_PAGE_SIZE", DEFAULT_PAGE_SIZE)),
            periodic_interval: Duration::from_secs(number(
                "AUDIOSHELF_PERIODIC_SECS",
                DEFAULT_PERIODIC_SECS,
            )),
            min_sync_interval: Duration::from_secs(number(
                "AUDIOSHELF_MIN_SYNC_INTERVAL_SECS",
                DEFAULT_MIN_SYNC_INTERVAL_SECS,
            )),
            push_interval: Duration::from_secs(number(
                "AUDIOSHELF_PUSH_INTERVAL_SECS",
                DEFAULT_PUSH_INTERVAL_SECS,
            )),
            cover_interval: Duration::from_secs(number(
                "AUDIOSHELF_COVER_INTERVAL_SECS",
                DEFAULT_COVER_INTERVAL_SECS,
            )),
            cover_batch_size: clamp_u32(number("AUDIOSHELF_COVER_BATCH", DEFAULT_COVER_BATCH)),
            cover_concurrency: number("AUDIOSHELF_COVER_CONCURRENCY", DEFAULT_COVER_CONCURRENCY)
                as usize,
            cover_max_attempts: clamp_u32(number(
                "AUDIOSHELF_COVER_MAX_ATTEMPTS",
                DEFAULT_COVER_MAX_ATTEMPTS,
            )),
            clock_skew: Duration::from_millis(number(
                "AUDIOSHELF_CLOCK_SKEW_MS",
                DEFAULT_CLOCK_SKEW_MS,
            )),
            realtime_max_attempts: clamp_u32(number(
                "AUDIOSHELF_REALTIME_MAX_ATTEMPTS",
                DEFAULT_REALTIME_MAX_ATTEMPTS,
            )),
            realtime_backoff_base: Duration::from_millis(number(
                "AUDIOSHELF_REALTIME_BACKOFF_BASE_MS",
                DEFAULT_REALTIME_BACKOFF_BASE_MS,
            )),
            realtime_backoff_max: Duration::from_millis(number(
                "AUDIOSHELF_REALTIME_BACKOFF_MAX_MS",
                DEFAULT_REALTIME_BACKOFF_MAX_MS,
            )),
            push_max_auto_retries: clamp_u32(number(
                "AUDIOSHELF_PUSH_MAX_AUTO_RETRIES",
                DEFAULT_PUSH_MAX_AUTO_RETRIES,
            )),
        })
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("audioshelf")
        .join("library.db")
}

fn default_cover_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("audioshelf")
        .join("covers")
}

fn expand_with_home(value: &str, home: Option<&Path>) -> PathBuf {
    let Some(home) = home else {
        return PathBuf::from(value);
    };
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
