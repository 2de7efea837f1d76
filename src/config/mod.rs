//! Application configuration management

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::browser::BrowserPoolConfig;
use crate::http::{HostRateLimitConfig, HttpClientConfig, RateLimit, RetryConfig};

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the YAML definitions
    pub definitions_path: String,

    /// SQLite URL or path for cookies and health. In-memory stores are used
    /// when unset.
    pub database_url: Option<String>,

    /// Base64 AES-256 key for cookies at rest
    pub encryption_key: Option<String>,

    pub user_agent: Option<String>,

    pub request_timeout: Duration,

    /// Requests per minute for definitions without `requestDelay`
    pub default_requests_per_minute: u32,

    pub host_requests_per_second: u32,
    pub host_burst_size: u32,

    pub max_retries: u32,

    /// Size of the headless browser pool (0 disables challenge solving)
    pub browser_pool_size: usize,
    pub browser_max_uses: u32,
    pub browser_max_age: Duration,
    pub browser_queue_timeout: Duration,

    pub cookie_sweep_interval: Duration,
    /// Longest a login is reused before logging in again
    pub session_ttl: Duration,
    pub search_cache_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("CARDIGANN_DATABASE_PATH")
            .or_else(|_| env::var("CARDIGANN_DATABASE_URL"))
            .ok()
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            definitions_path: env::var("CARDIGANN_DEFINITIONS_PATH")
                .unwrap_or_else(|_| "./definitions".to_string()),

            database_url,

            encryption_key: env::var("CARDIGANN_ENCRYPTION_KEY").ok(),

            user_agent: env::var("CARDIGANN_USER_AGENT").ok(),

            request_timeout: secs("CARDIGANN_REQUEST_TIMEOUT", 30)?,

            default_requests_per_minute: env::var("CARDIGANN_REQUESTS_PER_MINUTE")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid CARDIGANN_REQUESTS_PER_MINUTE")?,

            host_requests_per_second: env::var("CARDIGANN_HOST_RPS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid CARDIGANN_HOST_RPS")?,

            host_burst_size: env::var("CARDIGANN_HOST_BURST")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid CARDIGANN_HOST_BURST")?,

            max_retries: env::var("CARDIGANN_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("Invalid CARDIGANN_MAX_RETRIES")?,

            browser_pool_size: env::var("CARDIGANN_BROWSER_POOL_SIZE")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid CARDIGANN_BROWSER_POOL_SIZE")?,

            browser_max_uses: env::var("CARDIGANN_BROWSER_MAX_USES")
                .unwrap_or_else(|_| "50".to_string())
                .parse()
                .context("Invalid CARDIGANN_BROWSER_MAX_USES")?,

            browser_max_age: secs("CARDIGANN_BROWSER_MAX_AGE", 30 * 60)?,

            browser_queue_timeout: secs("CARDIGANN_BROWSER_QUEUE_TIMEOUT", 60)?,

            cookie_sweep_interval: secs("CARDIGANN_COOKIE_SWEEP_INTERVAL", 60 * 60)?,

            session_ttl: secs("CARDIGANN_SESSION_TTL", 30 * 24 * 60 * 60)?,

            search_cache_ttl: secs("CARDIGANN_SEARCH_CACHE_TTL", 5 * 60)?,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
            timeout: self.request_timeout,
            retry: RetryConfig {
                max_retries: self.max_retries,
                ..RetryConfig::default()
            },
            host_rate_limit: HostRateLimitConfig {
                requests_per_second: self.host_requests_per_second,
                burst_size: self.host_burst_size,
            },
            ..defaults
        }
    }

    pub fn browser_pool_config(&self) -> BrowserPoolConfig {
        BrowserPoolConfig {
            size: self.browser_pool_size,
            max_uses: self.browser_max_uses,
            max_age: self.browser_max_age,
            queue_timeout: self.browser_queue_timeout,
        }
    }

    pub fn default_rate_limit(&self) -> RateLimit {
        RateLimit::per_minute(self.default_requests_per_minute.max(1))
    }
}

/// Read a whole number of seconds
fn secs(var: &str, default: u64) -> Result<Duration> {
    let value: u64 = match env::var(var) {
        Ok(v) => v.parse().with_context(|| format!("Invalid {}", var))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(value))
}
