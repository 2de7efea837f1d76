//! Retry logic for indexer requests
//!
//! Failures are classified before deciding whether to retry: network errors
//! and 408/429/5xx responses are transient, anti-bot and everything else is
//! returned immediately. A `Retry-After` header replaces the computed backoff.

use std::future::Future;
use std::time::{Duration, SystemTime};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::warn;

use crate::indexer::error::IndexerError;

/// Longest `Retry-After` we are willing to honour
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_interval: Duration,
    /// Maximum backoff duration
    pub max_interval: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    /// Create an ExponentialBackoff from this config
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: self.multiplier,
            max_elapsed_time: Some(Duration::from_secs(120)),
            ..Default::default()
        }
    }
}

/// How a failed attempt should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection problems, timeouts and 408/5xx responses
    Transient,
    /// 429, optionally with a server-provided delay
    RateLimited { retry_after: Option<Duration> },
    /// Challenge pages are solved, not retried
    AntiBot,
    /// Anything else
    Permanent,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient | FailureKind::RateLimited { .. })
    }
}

/// Classify an error for retry purposes
pub fn classify(err: &IndexerError) -> FailureKind {
    match err {
        IndexerError::Network { .. } => FailureKind::Transient,
        IndexerError::Http {
            status: 429,
            retry_after,
            ..
        } => FailureKind::RateLimited {
            retry_after: *retry_after,
        },
        IndexerError::Http { status, .. } if is_transient_status(*status) => FailureKind::Transient,
        IndexerError::AntiBotDetected { .. } | IndexerError::AntiBotBypassFailed { .. } => {
            FailureKind::AntiBot
        }
        _ => FailureKind::Permanent,
    }
}

/// 429 (rate limit), 500-599 (server errors), 408 (timeout)
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || status == 408 || (500..600).contains(&status)
}

/// Parse a `Retry-After` value given either as seconds or as an HTTP date
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let delay = if let Ok(secs) = value.parse::<u64>() {
        Duration::from_secs(secs)
    } else {
        let at = httpdate::parse_http_date(value).ok()?;
        at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO)
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Execute an async operation, retrying transient failures with backoff
pub async fn retry_async<T, Fut, F>(
    mut operation: F,
    config: &RetryConfig,
    operation_name: &str,
) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    let mut attempts = 0;
    let mut backoff = config.to_backoff();

    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let kind = classify(&e);
                if !kind.is_retryable() {
                    return Err(e);
                }
                if attempts >= config.max_retries {
                    warn!(
                        operation = %operation_name,
                        attempts = attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = match kind {
                    FailureKind::RateLimited {
                        retry_after: Some(after),
                    } => Some(after),
                    _ => backoff.next_backoff(),
                };

                match delay {
                    Some(duration) => {
                        warn!(
                            operation = %operation_name,
                            attempt = attempts,
                            error = %e,
                            retry_in_ms = duration.as_millis() as u64,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(duration).await;
                    }
                    None => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn http(status: u16) -> IndexerError {
        IndexerError::Http {
            status,
            host: "h".into(),
            retry_after: None,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&http(503)), FailureKind::Transient);
        assert_eq!(classify(&http(408)), FailureKind::Transient);
        assert_eq!(classify(&http(404)), FailureKind::Permanent);
        assert_eq!(
            classify(&IndexerError::AntiBotDetected { host: "h".into() }),
            FailureKind::AntiBot
        );
        assert!(matches!(classify(&http(429)), FailureKind::RateLimited { .. }));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("99999"), Some(MAX_RETRY_AFTER));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_async(
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(http(502))
                    } else {
                        Ok("ok")
                    }
                }
            },
            &fast(),
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_async(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(IndexerError::AntiBotBypassFailed {
                        host: "h".into(),
                        reason: "no pool".into(),
                    })
                }
            },
            &fast(),
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = retry_async(
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(http(500))
                }
            },
            &fast(),
            "test",
        )
        .await;
        assert!(matches!(result, Err(IndexerError::Http { status: 500, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
