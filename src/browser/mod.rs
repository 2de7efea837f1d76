//! Pool of headless browsers used to solve anti-bot challenges
//!
//! Browsers are expensive, so a small fixed set is shared by every indexer.
//! Callers [`BrowserPool::acquire`] a lease, solve a challenge through it and
//! hand it back with [`BrowserPool::release`]. When every worker is busy the
//! caller is queued until a worker frees up or its timeout elapses.
//!
//! [`BrowserPool::start`] launches the whole set up front so the first
//! challenge does not pay for a cold browser.
//!
//! Workers are recycled after `max_uses` solves or once they are older than
//! `max_age`; a replacement is launched right away unless the pool is
//! shutting down.

#[cfg(feature = "chrome")]
pub mod chrome;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::indexer::error::{IndexerError, IndexerResult};

/// Number of recent solves used for the rolling health figures
const HEALTH_WINDOW: usize = 50;

/// Result of solving a challenge in a real browser
#[derive(Debug, Clone, Default)]
pub struct ChallengeSolution {
    pub cookies: HashMap<String, String>,
    /// Cookie expiries where the browser reported one
    pub cookie_expiry: HashMap<String, DateTime<Utc>>,
    pub body: String,
    pub final_url: String,
}

/// A running browser able to solve challenges
#[async_trait]
pub trait BrowserWorker: Send {
    /// Load `url` until the challenge clears and return the resulting state
    async fn solve(&mut self, url: &str, user_agent: &str) -> anyhow::Result<ChallengeSolution>;

    /// Return to a clean state between leases
    async fn reset(&mut self) -> anyhow::Result<()>;

    async fn close(&mut self);
}

/// Starts new browser workers
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Box<dyn BrowserWorker>>;
}

#[derive(Debug, Clone)]
pub struct BrowserPoolConfig {
    pub size: usize,
    pub max_uses: u32,
    pub max_age: Duration,
    pub queue_timeout: Duration,
}

impl Default for BrowserPoolConfig {
    fn default() -> Self {
        Self {
            size: 2,
            max_uses: 50,
            max_age: Duration::from_secs(30 * 60),
            queue_timeout: Duration::from_secs(60),
        }
    }
}

/// Bookkeeping for one pooled browser
#[derive(Debug, Clone)]
pub struct BrowserInstance {
    pub id: Uuid,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub use_count: u32,
}

struct PooledBrowser {
    info: BrowserInstance,
    worker: Box<dyn BrowserWorker>,
}

impl PooledBrowser {
    fn new(worker: Box<dyn BrowserWorker>) -> Self {
        let now = Instant::now();
        Self {
            info: BrowserInstance {
                id: Uuid::new_v4(),
                created_at: now,
                last_used_at: now,
                use_count: 0,
            },
            worker,
        }
    }

    fn is_worn_out(&self, config: &BrowserPoolConfig) -> bool {
        self.info.use_count >= config.max_uses || self.info.created_at.elapsed() >= config.max_age
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledBrowser>,
    /// Live workers including ones being launched
    total: usize,
    waiters: VecDeque<oneshot::Sender<PooledBrowser>>,
    closed: bool,
    solve_times: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
}

struct PoolInner {
    launcher: Arc<dyn BrowserLauncher>,
    config: BrowserPoolConfig,
    state: Mutex<PoolState>,
}

/// Snapshot of pool health
#[derive(Debug, Clone, PartialEq)]
pub struct PoolHealth {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub queue_depth: usize,
    pub avg_solve_time: Option<Duration>,
    pub success_rate: Option<f64>,
}

/// Exclusive use of one browser until released
pub struct BrowserLease {
    browser: Option<PooledBrowser>,
    pool: Weak<PoolInner>,
    acquired_at: Instant,
}

impl BrowserLease {
    pub fn id(&self) -> Option<Uuid> {
        self.browser.as_ref().map(|b| b.info.id)
    }

    pub fn info(&self) -> Option<&BrowserInstance> {
        self.browser.as_ref().map(|b| &b.info)
    }

    /// Solve a challenge with the leased browser
    pub async fn solve(&mut self, url: &str, user_agent: &str) -> anyhow::Result<ChallengeSolution> {
        match self.browser.as_mut() {
            Some(b) => b.worker.solve(url, user_agent).await,
            None => anyhow::bail!("browser lease already released"),
        }
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        // Dropped without release: give up the slot so the pool can relaunch
        if self.browser.take().is_some()
            && let Some(pool) = self.pool.upgrade()
        {
            let mut state = pool.state.lock();
            state.total = state.total.saturating_sub(1);
            warn!("Browser lease dropped without release");
        }
    }
}

/// Shared pool of browser workers
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl BrowserPool {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: BrowserPoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                launcher,
                config,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn config(&self) -> &BrowserPoolConfig {
        &self.inner.config
    }

    /// Launch workers until the pool holds `size` of them.
    ///
    /// Returns how many started. Slots whose launch fails stay free and are
    /// retried lazily by [`BrowserPool::acquire`].
    pub async fn start(&self) -> usize {
        let wanted = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return 0;
            }
            let wanted = self.inner.config.size.saturating_sub(state.total);
            state.total += wanted;
            wanted
        };

        let launches = (0..wanted).map(|_| self.launch());
        let mut started = 0;
        for outcome in join_all(launches).await {
            match outcome {
                Ok(browser) => {
                    started += 1;
                    self.hand_off(browser).await;
                }
                Err(_) => {
                    self.inner.state.lock().total -= 1;
                }
            }
        }
        info!(started, size = self.inner.config.size, "Browser pool warmed up");
        started
    }

    fn lease(&self, browser: PooledBrowser) -> BrowserLease {
        BrowserLease {
            browser: Some(browser),
            pool: Arc::downgrade(&self.inner),
            acquired_at: Instant::now(),
        }
    }

    /// Acquire a browser, queueing for at most `timeout` when all are busy
    pub async fn acquire(&self, timeout: Duration) -> IndexerResult<BrowserLease> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(IndexerError::BrowserPoolClosed);
            }
            if let Some(browser) = state.idle.pop_front() {
                return Ok(self.lease(browser));
            }
            if state.total < self.inner.config.size {
                state.total += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                debug!(queue_depth = state.waiters.len(), "Browser pool saturated, queueing");
                Some(rx)
            }
        };

        let Some(mut rx) = rx else {
            return match self.launch().await {
                Ok(browser) => Ok(self.lease(browser)),
                Err(e) => {
                    self.inner.state.lock().total -= 1;
                    Err(e)
                }
            };
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(browser)) => Ok(self.lease(browser)),
            Ok(Err(_)) => Err(IndexerError::BrowserPoolClosed),
            Err(_) => {
                // A browser may have been handed over right as the timer fired
                rx.close();
                match rx.try_recv() {
                    Ok(browser) => Ok(self.lease(browser)),
                    Err(_) => {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for a browser");
                        Err(IndexerError::BrowserPoolExhausted { timeout })
                    }
                }
            }
        }
    }

    async fn launch(&self) -> IndexerResult<PooledBrowser> {
        match self.inner.launcher.launch().await {
            Ok(worker) => {
                let browser = PooledBrowser::new(worker);
                info!(browser_id = %browser.info.id, "Launched browser");
                Ok(browser)
            }
            Err(e) => {
                warn!(error = %e, "Failed to launch browser");
                Err(IndexerError::AntiBotBypassFailed {
                    host: String::new(),
                    reason: format!("browser launch failed: {}", e),
                })
            }
        }
    }

    /// Return a lease, recording whether the solve succeeded
    pub async fn release(&self, mut lease: BrowserLease, success: bool) {
        let Some(mut browser) = lease.browser.take() else {
            return;
        };
        let solve_time = lease.acquired_at.elapsed();
        browser.info.use_count += 1;
        browser.info.last_used_at = Instant::now();

        let closed = {
            let mut state = self.inner.state.lock();
            push_bounded(&mut state.solve_times, solve_time);
            push_bounded(&mut state.outcomes, success);
            state.closed
        };

        if closed {
            browser.worker.close().await;
            self.inner.state.lock().total -= 1;
            return;
        }

        let mut recycle = browser.is_worn_out(&self.inner.config);
        if !recycle && let Err(e) = browser.worker.reset().await {
            warn!(browser_id = %browser.info.id, error = %e, "Browser reset failed, recycling");
            recycle = true;
        }

        if recycle {
            debug!(
                browser_id = %browser.info.id,
                use_count = browser.info.use_count,
                "Recycling browser"
            );
            browser.worker.close().await;
            // The slot stays reserved for the replacement
            match self.launch().await {
                Ok(fresh) => self.hand_off(fresh).await,
                Err(_) => {
                    self.inner.state.lock().total -= 1;
                }
            }
        } else {
            self.hand_off(browser).await;
        }
    }

    /// Give a browser to the next live waiter, or park it as idle
    async fn hand_off(&self, mut browser: PooledBrowser) {
        let leftover = {
            let mut state = self.inner.state.lock();
            if state.closed {
                Some(browser)
            } else {
                loop {
                    match state.waiters.pop_front() {
                        Some(tx) => match tx.send(browser) {
                            Ok(()) => break None,
                            Err(returned) => browser = returned,
                        },
                        None => {
                            state.idle.push_back(browser);
                            break None;
                        }
                    }
                }
            }
        };
        if let Some(mut browser) = leftover {
            browser.worker.close().await;
            self.inner.state.lock().total -= 1;
        }
    }

    pub fn health(&self) -> PoolHealth {
        let state = self.inner.state.lock();
        let available = state.idle.len();
        let avg_solve_time = if state.solve_times.is_empty() {
            None
        } else {
            Some(state.solve_times.iter().sum::<Duration>() / state.solve_times.len() as u32)
        };
        let success_rate = if state.outcomes.is_empty() {
            None
        } else {
            Some(state.outcomes.iter().filter(|ok| **ok).count() as f64 / state.outcomes.len() as f64)
        };
        PoolHealth {
            total: state.total,
            available,
            busy: state.total.saturating_sub(available),
            queue_depth: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            avg_solve_time,
            success_rate,
        }
    }

    /// Close idle browsers and reject queued and future acquires.
    ///
    /// Leased browsers are closed when they are released.
    pub async fn shutdown(&self) {
        let idle: Vec<PooledBrowser> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.waiters.clear();
            state.idle.drain(..).collect()
        };
        let count = idle.len();
        for mut browser in idle {
            browser.worker.close().await;
        }
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(count);
        info!(closed = count, "Browser pool shut down");
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T) {
    if queue.len() >= HEALTH_WINDOW {
        queue.pop_front();
    }
    queue.push_back(value);
}

/// Worker that can never solve anything; used when no browser is installed
#[derive(Debug, Default)]
pub struct UnavailableLauncher;

#[async_trait]
impl BrowserLauncher for UnavailableLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn BrowserWorker>> {
        anyhow::bail!("no headless browser available in this build")
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLauncher;
    use super::*;
    use std::sync::atomic::Ordering;

    fn pool(size: usize, max_uses: u32) -> (BrowserPool, Arc<FakeLauncher>) {
        let launcher = Arc::new(FakeLauncher::default());
        let pool = BrowserPool::new(
            launcher.clone(),
            BrowserPoolConfig {
                size,
                max_uses,
                max_age: Duration::from_secs(3600),
                queue_timeout: Duration::from_secs(1),
            },
        );
        (pool, launcher)
    }

    #[tokio::test]
    async fn test_acquire_and_release_reuses_worker() {
        let (pool, launcher) = pool(1, 10);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let id = lease.id();
        pool.release(lease, true).await;
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
        pool.release(lease, true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_times_out_when_saturated() {
        let (pool, _) = pool(1, 10);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(200)).await.err().unwrap();
        assert!(matches!(err, IndexerError::BrowserPoolExhausted { .. }));
        assert_eq!(pool.health().busy, 1);
        pool.release(held, true).await;
        assert_eq!(pool.health().available, 1);
    }

    #[tokio::test]
    async fn test_waiter_receives_released_worker() {
        let (pool, _) = pool(1, 10);
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        while pool.health().queue_depth == 0 {
            tokio::task::yield_now().await;
        }
        pool.release(held, true).await;
        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(pool.health().total, 1);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_busy_never_exceeds_size() {
        let (pool, _) = pool(2, 100);
        let mut handles = Vec::new();
        for _ in 0..6 {
            let p = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = p.acquire(Duration::from_secs(5)).await.unwrap();
                assert!(p.health().busy <= 2);
                tokio::task::yield_now().await;
                p.release(lease, true).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let health = pool.health();
        assert!(health.total <= 2);
        assert_eq!(health.success_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_worn_out_worker_is_replaced() {
        let (pool, launcher) = pool(1, 1);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let first = lease.id();
        pool.release(lease, false).await;
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);

        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.id(), first);
        assert_eq!(pool.health().success_rate, Some(0.0));
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_start_launches_every_worker() {
        let (pool, launcher) = pool(3, 10);
        assert_eq!(pool.start().await, 3);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
        let health = pool.health();
        assert_eq!((health.total, health.available, health.busy), (3, 3, 0));

        // Already full, nothing more to launch
        assert_eq!(pool.start().await, 0);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 3);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_start_after_shutdown_launches_nothing() {
        let (pool, launcher) = pool(2, 10);
        pool.shutdown().await;
        assert_eq!(pool.start().await, 0);
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let (pool, launcher) = pool(1, 10);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(lease, true).await;
        pool.shutdown().await;
        assert_eq!(launcher.closed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            pool.acquire(Duration::from_secs(1)).await,
            Err(IndexerError::BrowserPoolClosed)
        ));
    }
}
