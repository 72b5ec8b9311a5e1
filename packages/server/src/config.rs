use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

/// Where job records and work items live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Single-process, non-durable; for development and tests
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => bail!("unknown STORAGE_BACKEND '{other}' (expected postgres or memory)"),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub worker_concurrency: usize,
    pub job_ttl: Duration,
    pub queue_job_timeout: Duration,
    pub queue_max_attempts: u32,
    pub queue_backoff_base: Duration,
    pub queue_lease: Duration,
    pub queue_poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_stale_pending: Duration,
    pub cleanup_max_age: Duration,
    pub shutdown_grace: Duration,
    pub fetch_timeout: Duration,
    /// Re-resolve submitted hosts and reject private addresses before fetching
    pub dns_check: bool,
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            storage_backend: StorageBackend::Memory,
            database_url: None,
            worker_concurrency: 2,
            job_ttl: Duration::from_secs(48 * 60 * 60),
            queue_job_timeout: Duration::from_millis(5_000),
            queue_max_attempts: 3,
            queue_backoff_base: Duration::from_millis(1_000),
            queue_lease: Duration::from_secs(30),
            queue_poll_interval: Duration::from_millis(500),
            cleanup_interval: Duration::from_secs(5 * 60),
            cleanup_stale_pending: Duration::from_secs(10 * 60),
            cleanup_max_age: Duration::from_secs(30 * 60),
            shutdown_grace: Duration::from_secs(25),
            fetch_timeout: Duration::from_secs(60),
            dns_check: true,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        let defaults = Self::default();

        let storage_backend = match env::var("STORAGE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StorageBackend::Postgres,
        };

        let database_url = env::var("DATABASE_URL").ok();
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            bail!("DATABASE_URL must be set when STORAGE_BACKEND=postgres");
        }

        let worker_concurrency: usize = parse_var("WORKER_CONCURRENCY", defaults.worker_concurrency)?;
        if worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        let queue_max_attempts: u32 = parse_var("QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?;
        if queue_max_attempts == 0 {
            bail!("QUEUE_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            port: parse_var("PORT", defaults.port)?,
            storage_backend,
            database_url,
            worker_concurrency,
            job_ttl: Duration::from_secs(parse_var::<u64>("JOB_TTL_HOURS", 48)? * 60 * 60),
            queue_job_timeout: millis_var("QUEUE_JOB_TIMEOUT_MS", defaults.queue_job_timeout)?,
            queue_max_attempts,
            queue_backoff_base: millis_var("QUEUE_BACKOFF_BASE_MS", defaults.queue_backoff_base)?,
            queue_lease: millis_var("QUEUE_LEASE_MS", defaults.queue_lease)?,
            queue_poll_interval: millis_var("QUEUE_POLL_INTERVAL_MS", defaults.queue_poll_interval)?,
            cleanup_interval: secs_var("CLEANUP_INTERVAL_SECS", defaults.cleanup_interval)?,
            cleanup_stale_pending: secs_var(
                "CLEANUP_STALE_PENDING_SECS",
                defaults.cleanup_stale_pending,
            )?,
            cleanup_max_age: secs_var("CLEANUP_MAX_AGE_SECS", defaults.cleanup_max_age)?,
            shutdown_grace: secs_var("SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            fetch_timeout: secs_var("FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            dns_check: bool_var("URL_DNS_CHECK", defaults.dns_check)?,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

fn bool_var(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{name} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.worker_concurrency, 2);
        assert_eq!(config.job_ttl, Duration::from_secs(172_800));
        assert_eq!(config.queue_job_timeout, Duration::from_millis(5_000));
        assert_eq!(config.queue_max_attempts, 3);
        assert_eq!(config.cleanup_interval, Duration::from_secs(300));
        assert_eq!(config.cleanup_stale_pending, Duration::from_secs(600));
        assert_eq!(config.cleanup_max_age, Duration::from_secs(1_800));
    }

    #[test]
    fn storage_backend_parses_case_insensitively() {
        assert_eq!("Postgres".parse::<StorageBackend>().unwrap(), StorageBackend::Postgres);
        assert_eq!(" memory ".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert!("redis".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn origin_list_skips_blanks() {
        assert_eq!(
            parse_list("https://a.example, ,https://b.example,"),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
