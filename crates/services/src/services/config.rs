use std::{env, time::Duration};

use secrecy::SecretString;
use thiserror::Error;

use super::{feed_cache::DEFAULT_FEED_TTL, retry::RetryPolicy};

pub const DEFAULT_STORAGE_BUCKET: &str = "blog-photos";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable `{0}` is not set")]
    MissingVar(&'static str),
    #[error("invalid value for environment variable `{0}`")]
    InvalidVar(&'static str),
}

/// Knobs the services need regardless of which backend they talk to.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub storage_bucket: String,
    pub retry: RetryPolicy,
    pub feed_cache_ttl: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            retry: RetryPolicy::default(),
            feed_cache_ttl: DEFAULT_FEED_TTL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlogConfig {
    pub backend_url: String,
    pub anon_key: SecretString,
    pub request_timeout: Duration,
    pub settings: ServiceSettings,
}

impl BlogConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend_url =
            var("BLOG_BACKEND_URL").ok_or(ConfigError::MissingVar("BLOG_BACKEND_URL"))?;
        if !(backend_url.starts_with("http://") || backend_url.starts_with("https://")) {
            return Err(ConfigError::InvalidVar("BLOG_BACKEND_URL"));
        }

        let anon_key = var("BLOG_BACKEND_ANON_KEY")
            .ok_or(ConfigError::MissingVar("BLOG_BACKEND_ANON_KEY"))?;

        let storage_bucket =
            var("BLOG_STORAGE_BUCKET").unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.to_string());

        let defaults = RetryPolicy::default();
        let max_retries = parse_or(&var, "BLOG_MAX_RETRIES", defaults.max_retries)?;
        let base_delay_ms = parse_or(
            &var,
            "BLOG_RETRY_BASE_DELAY_MS",
            defaults.base_delay.as_millis() as u64,
        )?;
        let max_delay_ms = parse_or(
            &var,
            "BLOG_RETRY_MAX_DELAY_MS",
            defaults.max_delay.as_millis() as u64,
        )?;
        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::InvalidVar("BLOG_RETRY_MAX_DELAY_MS"));
        }

        let feed_cache_ttl_secs = parse_or(
            &var,
            "BLOG_FEED_CACHE_TTL_SECS",
            DEFAULT_FEED_TTL.as_secs(),
        )?;
        let request_timeout_secs = parse_or(
            &var,
            "BLOG_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;
        if request_timeout_secs == 0 {
            return Err(ConfigError::InvalidVar("BLOG_REQUEST_TIMEOUT_SECS"));
        }

        tracing::info!(
            backend_url = %backend_url,
            storage_bucket = %storage_bucket,
            max_retries,
            feed_cache_ttl_secs,
            "Blog config loaded successfully"
        );

        Ok(Self {
            backend_url,
            anon_key: SecretString::new(anon_key.into()),
            request_timeout: Duration::from_secs(request_timeout_secs),
            settings: ServiceSettings {
                storage_bucket,
                retry: RetryPolicy {
                    max_retries,
                    base_delay: Duration::from_millis(base_delay_ms),
                    max_delay: Duration::from_millis(max_delay_ms),
                },
                feed_cache_ttl: Duration::from_secs(feed_cache_ttl_secs),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidVar(key)),
        None => Ok(default),
    }
}
