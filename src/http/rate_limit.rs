//! Request rate limiting
//!
//! Two layers run before every outbound request:
//!
//! - [`IndexerRateLimiter`]: a sliding-window log per indexer id. A request is
//!   admitted only when fewer than `max_requests` were admitted in the
//!   preceding `period`; checking and recording happen under one lock so
//!   concurrent searches can never overshoot the window.
//! - [`HostRateLimiter`]: a `governor` keyed limiter per host, shared by every
//!   indexer that points at the same site.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter, clock::DefaultClock, state::keyed::DefaultKeyedStateStore};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::indexer::error::{IndexerError, IndexerResult};

/// `max_requests` per rolling `period`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn new(max_requests: u32, period: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            period,
        }
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// One request per `delay`, as expressed by a definition's `requestDelay`
    pub fn from_request_delay(delay_secs: f64) -> Self {
        Self::new(1, Duration::from_secs_f64(delay_secs.max(0.0)))
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::per_minute(30)
    }
}

/// Sliding-window limiter keyed by indexer id
#[derive(Debug, Default)]
pub struct IndexerRateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl IndexerRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to admit one request now.
    ///
    /// Returns `Ok(())` when the request was recorded, or `Err(wait)` with the
    /// time until the oldest entry leaves the window.
    fn try_admit(&self, key: &str, limit: RateLimit, now: Instant) -> Result<(), Duration> {
        let mut windows = self.windows.lock();
        let log = windows.entry(key.to_string()).or_default();

        while let Some(&oldest) = log.front() {
            if now.duration_since(oldest) >= limit.period {
                log.pop_front();
            } else {
                break;
            }
        }

        if log.len() < limit.max_requests as usize {
            log.push_back(now);
            return Ok(());
        }

        // Window is full; the front entry is the next to expire
        let oldest = log.front().copied().unwrap_or(now);
        Err(limit.period.saturating_sub(now.duration_since(oldest)))
    }

    /// Wait until a request for `key` is admitted.
    ///
    /// Fails with [`IndexerError::RateLimitWaitExceeded`] instead of waiting
    /// longer than `max_wait` in total.
    pub async fn acquire(&self, key: &str, limit: RateLimit, max_wait: Duration) -> IndexerResult<Duration> {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            match self.try_admit(key, limit, now) {
                Ok(()) => {
                    let waited = now.duration_since(started);
                    if !waited.is_zero() {
                        debug!(indexer_id = %key, waited_ms = waited.as_millis() as u64, "Rate limit wait complete");
                    }
                    return Ok(waited);
                }
                Err(wait) => {
                    let waited = now.duration_since(started);
                    if waited + wait > max_wait {
                        warn!(
                            indexer_id = %key,
                            wait_ms = (waited + wait).as_millis() as u64,
                            "Rate limit wait exceeds maximum"
                        );
                        return Err(IndexerError::RateLimitWaitExceeded {
                            waited: waited + wait,
                        });
                    }
                    // Small slack so the oldest entry has definitely left the window
                    tokio::time::sleep(wait + Duration::from_millis(1)).await;
                }
            }
        }
    }

    /// Number of requests admitted within the last `period`
    pub fn in_window(&self, key: &str, period: Duration) -> usize {
        let now = Instant::now();
        self.windows
            .lock()
            .get(key)
            .map(|log| log.iter().filter(|t| now.duration_since(**t) < period).count())
            .unwrap_or(0)
    }

    /// Forget all state for an indexer
    pub fn reset(&self, key: &str) {
        self.windows.lock().remove(key);
    }
}

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Configuration for the per-host limiter
#[derive(Debug, Clone)]
pub struct HostRateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Default for HostRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            burst_size: 5,
        }
    }
}

/// Token-bucket limiter keyed by host name
pub struct HostRateLimiter {
    limiter: Arc<KeyedLimiter>,
}

impl std::fmt::Debug for HostRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRateLimiter").finish_non_exhaustive()
    }
}

impl HostRateLimiter {
    pub fn new(config: HostRateLimitConfig) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
        )
        .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Wait for a permit for `host`
    pub async fn wait_for_permit(&self, host: &str) {
        self.limiter.until_key_ready(&host.to_ascii_lowercase()).await;
    }
}

impl Default for HostRateLimiter {
    fn default() -> Self {
        Self::new(HostRateLimitConfig::default())
    }
}
