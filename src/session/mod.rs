//! Session cookies and indexer health
//!
//! The engine keeps cookies per indexer in memory and writes them through a
//! [`SessionStore`]. Health records go through a [`HealthStore`]. Both stores
//! are best effort: when they fail the error is logged and the in-memory
//! state keeps working.

pub mod encryption;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::http::SetCookie;
use crate::http::cookies::is_sentinel;

pub use memory::MemoryStore;

/// How far ahead the sweeper warns about expiring sessions
pub const COOKIE_EXPIRY_WARNING: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a login is trusted before the engine logs in again
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Persisted login state for one indexer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub cookie_expiry: HashMap<String, DateTime<Utc>>,
    pub session_expiry: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CookieRecord {
    pub fn new(cookies: HashMap<String, String>) -> Self {
        Self {
            cookies,
            updated_at: Utc::now(),
            ..Default::default()
        }
    }

    /// Build a record from cookies returned by a login response
    pub fn from_set_cookies(set: &[SetCookie], now: DateTime<Utc>) -> Self {
        let mut record = Self {
            updated_at: now,
            ..Default::default()
        };
        record.apply_set_cookies(set, now);
        record
    }

    pub fn apply_set_cookies(&mut self, set: &[SetCookie], now: DateTime<Utc>) {
        for c in set {
            if c.is_deletion(now) {
                self.cookies.remove(&c.name);
                self.cookie_expiry.remove(&c.name);
                continue;
            }
            self.cookies.insert(c.name.clone(), c.value.clone());
            match c.expires {
                Some(at) => {
                    self.cookie_expiry.insert(c.name.clone(), at);
                }
                None => {
                    self.cookie_expiry.remove(&c.name);
                }
            }
        }
        self.updated_at = now;
    }

    /// Bound the session to `ttl` from `now`, or to the last cookie expiry
    /// when every real cookie carries one and it comes sooner.
    pub fn expire_session_after(&mut self, ttl: Duration, now: DateTime<Utc>) {
        let by_ttl = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));
        let real: Vec<&String> = self.cookies.keys().filter(|n| !is_sentinel(n)).collect();
        let by_cookies = if real.is_empty() {
            None
        } else {
            real.iter()
                .map(|n| self.cookie_expiry.get(*n).copied())
                .collect::<Option<Vec<_>>>()
                .and_then(|expiries| expiries.into_iter().max())
        };
        self.session_expiry = match (by_ttl, by_cookies) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    /// Drop expired cookies. Returns `None` when the whole session is gone.
    pub fn without_expired(mut self, now: DateTime<Utc>) -> Option<Self> {
        if self.session_expiry.is_some_and(|e| e <= now) {
            return None;
        }
        let expired: Vec<String> = self
            .cookie_expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.cookies.remove(&name);
            self.cookie_expiry.remove(&name);
        }
        if self.cookies.is_empty() {
            None
        } else {
            Some(self)
        }
    }

    /// Earliest moment a cookie or the session itself expires
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.cookie_expiry
            .values()
            .copied()
            .chain(self.session_expiry)
            .min()
    }
}

/// Persistence boundary for session cookies
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_cookies(&self, indexer_id: &str) -> Result<Option<CookieRecord>>;
    async fn save_cookies(&self, indexer_id: &str, record: &CookieRecord) -> Result<()>;
    async fn clear_cookies(&self, indexer_id: &str) -> Result<()>;
}

/// Last known health of one indexer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexerHealth {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
}

impl IndexerHealth {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.last_success_at = Some(at);
        self.error_count = 0;
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>, message: impl Into<String>) {
        self.last_error_at = Some(at);
        self.last_error = Some(message.into());
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn is_failing(&self) -> bool {
        self.error_count > 0
    }
}

/// Persistence boundary for indexer health
#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn load_health(&self, indexer_id: &str) -> Result<Option<IndexerHealth>>;
    async fn save_health(&self, indexer_id: &str, health: &IndexerHealth) -> Result<()>;
}

/// In-memory cookie cache in front of a [`SessionStore`]
pub struct CookieStore {
    cache: RwLock<HashMap<String, CookieRecord>>,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for CookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieStore")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

impl CookieStore {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Load live cookies for an indexer.
    ///
    /// Expired cookies are never returned; a record whose session expired or
    /// that has nothing left after filtering is cleared.
    pub async fn load(&self, indexer_id: &str) -> Option<CookieRecord> {
        let now = Utc::now();
        let cached = self.cache.read().get(indexer_id).cloned();
        let record = match cached {
            Some(record) => Some(record),
            None => match self.store.load_cookies(indexer_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(indexer_id = %indexer_id, error = %e, "Failed to load cookies from store");
                    None
                }
            },
        };

        match record?.without_expired(now) {
            Some(live) => {
                self.cache.write().insert(indexer_id.to_string(), live.clone());
                Some(live)
            }
            None => {
                debug!(indexer_id = %indexer_id, "Stored session expired, clearing");
                self.clear(indexer_id).await;
                None
            }
        }
    }

    /// Cookie map for requests; empty when logged out
    pub async fn cookies(&self, indexer_id: &str) -> HashMap<String, String> {
        self.load(indexer_id)
            .await
            .map(|r| r.cookies)
            .unwrap_or_default()
    }

    pub async fn save(&self, indexer_id: &str, record: CookieRecord) {
        self.cache.write().insert(indexer_id.to_string(), record.clone());
        if let Err(e) = self.store.save_cookies(indexer_id, &record).await {
            warn!(indexer_id = %indexer_id, error = %e, "Failed to persist cookies, keeping in memory");
        }
    }

    /// Merge cookies set by a response into the stored session
    pub async fn merge(&self, indexer_id: &str, set: &[SetCookie]) {
        if set.is_empty() {
            return;
        }
        let now = Utc::now();
        let mut record = self.load(indexer_id).await.unwrap_or_else(|| CookieRecord {
            updated_at: now,
            ..Default::default()
        });
        record.apply_set_cookies(set, now);
        self.save(indexer_id, record).await;
    }

    pub async fn clear(&self, indexer_id: &str) {
        self.cache.write().remove(indexer_id);
        if let Err(e) = self.store.clear_cookies(indexer_id).await {
            warn!(indexer_id = %indexer_id, error = %e, "Failed to clear stored cookies");
        }
    }

    /// Indexer ids whose session expires within `window`.
    ///
    /// Only cached sessions are considered.
    pub fn sweep_expiring(&self, window: Duration) -> Vec<String> {
        let horizon = Utc::now() + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        let mut expiring: Vec<String> = self
            .cache
            .read()
            .iter()
            .filter(|(_, r)| r.earliest_expiry().is_some_and(|e| e <= horizon))
            .map(|(id, _)| id.clone())
            .collect();
        expiring.sort();
        for id in &expiring {
            warn!(indexer_id = %id, "Indexer session expires soon; it will log in again on next use");
        }
        expiring
    }

    /// Run [`sweep_expiring`](Self::sweep_expiring) every `interval`
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.sweep_expiring(COOKIE_EXPIRY_WARNING);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn load_cookies(&self, _: &str) -> Result<Option<CookieRecord>> {
            anyhow::bail!("database down")
        }
        async fn save_cookies(&self, _: &str, _: &CookieRecord) -> Result<()> {
            anyhow::bail!("database down")
        }
        async fn clear_cookies(&self, _: &str) -> Result<()> {
            anyhow::bail!("database down")
        }
    }

    fn record(now: DateTime<Utc>) -> CookieRecord {
        let mut r = CookieRecord::new(HashMap::from([
            ("uid".to_string(), "1".to_string()),
            ("pass".to_string(), "x".to_string()),
        ]));
        r.cookie_expiry.insert("pass".to_string(), now - ChronoDuration::minutes(1));
        r.cookie_expiry.insert("uid".to_string(), now + ChronoDuration::hours(2));
        r
    }

    #[test]
    fn test_expired_cookie_filtered() {
        let now = Utc::now();
        let live = record(now).without_expired(now).unwrap();
        assert!(!live.cookies.contains_key("pass"));
        assert_eq!(live.cookies.get("uid").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_expire_session_after() {
        let now = Utc::now();
        let ttl = Duration::from_secs(3600);

        let mut sentinel_only = CookieRecord::new(HashMap::from([(
            crate::http::cookies::BASIC_AUTH_SENTINEL.to_string(),
            "u:p".to_string(),
        )]));
        sentinel_only.expire_session_after(ttl, now);
        assert_eq!(sentinel_only.session_expiry, Some(now + ChronoDuration::hours(1)));

        let mut short_cookies = record(now);
        short_cookies
            .cookie_expiry
            .insert("pass".to_string(), now + ChronoDuration::minutes(10));
        short_cookies
            .cookie_expiry
            .insert("uid".to_string(), now + ChronoDuration::minutes(5));
        short_cookies.expire_session_after(ttl, now);
        assert_eq!(short_cookies.session_expiry, Some(now + ChronoDuration::minutes(10)));

        let mut session_cookie = CookieRecord::new(HashMap::from([("uid".to_string(), "1".to_string())]));
        session_cookie.expire_session_after(ttl, now);
        assert_eq!(session_cookie.session_expiry, Some(now + ChronoDuration::hours(1)));
    }

    #[test]
    fn test_session_expiry_clears_record() {
        let now = Utc::now();
        let mut r = record(now);
        r.session_expiry = Some(now - ChronoDuration::seconds(1));
        assert!(r.without_expired(now).is_none());

        let mut r = record(now);
        r.cookie_expiry.insert("uid".to_string(), now);
        assert!(r.without_expired(now).is_none());
    }

    #[tokio::test]
    async fn test_store_never_returns_expired_cookies() {
        let store = CookieStore::in_memory();
        let now = Utc::now();
        store.save("idx", record(now)).await;
        let loaded = store.load("idx").await.unwrap();
        assert_eq!(loaded.cookies.len(), 1);
        assert!(loaded.cookies.contains_key("uid"));
    }

    #[tokio::test]
    async fn test_failing_store_keeps_memory_state() {
        let store = CookieStore::new(Arc::new(FailingStore));
        assert!(store.load("idx").await.is_none());
        store
            .save("idx", CookieRecord::new(HashMap::from([("a".into(), "1".into())])))
            .await;
        assert_eq!(store.cookies("idx").await.get("a").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_merge_and_sweep() {
        let store = CookieStore::in_memory();
        let now = Utc::now();
        store
            .merge(
                "soon",
                &[SetCookie {
                    name: "sid".into(),
                    value: "1".into(),
                    expires: Some(now + ChronoDuration::hours(1)),
                }],
            )
            .await;
        store
            .merge(
                "later",
                &[SetCookie {
                    name: "sid".into(),
                    value: "2".into(),
                    expires: Some(now + ChronoDuration::days(30)),
                }],
            )
            .await;
        assert_eq!(store.sweep_expiring(COOKIE_EXPIRY_WARNING), vec!["soon".to_string()]);
    }

    #[test]
    fn test_health_counters() {
        let mut h = IndexerHealth::default();
        let now = Utc::now();
        h.record_failure(now, "timeout");
        h.record_failure(now, "timeout");
        assert_eq!(h.error_count, 2);
        h.record_success(now);
        assert!(!h.is_failing());
        assert_eq!(h.last_error.as_deref(), Some("timeout"));
    }
}
