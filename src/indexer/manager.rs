//! Indexer Manager
//!
//! The IndexerManager is responsible for:
//! - Instantiating configured indexers from the definition catalog
//! - Orchestrating searches across multiple indexers
//! - Caching search results
//! - Recording indexer health after every search and test

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Semaphore;

use super::cardigann::CardigannIndexer;
use super::definitions::{DefinitionCatalog, IndexerDefinition};
use super::{DownloadContent, Indexer, IndexerContext, IndexerInstanceConfig, ReleaseInfo, SearchCriteria};
use crate::session::HealthStore;

/// Default cache TTL (5 minutes)
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Maximum concurrent searches per indexer
const MAX_CONCURRENT_SEARCHES: usize = 2;

/// Outcome of searching one indexer
#[derive(Debug, Clone, Serialize)]
pub struct IndexerSearchResult {
    pub indexer_id: String,
    pub indexer_name: String,
    pub releases: Vec<ReleaseInfo>,
    pub elapsed_ms: u64,
    pub from_cache: bool,
    /// Concise, non-sensitive error message
    pub error: Option<String>,
}

/// Manages all configured indexer instances
pub struct IndexerManager {
    catalog: RwLock<DefinitionCatalog>,
    ctx: IndexerContext,
    /// Loaded indexer instances by config id
    indexers: RwLock<HashMap<String, Arc<dyn Indexer>>>,
    /// Lower runs first when ordering results
    priorities: RwLock<HashMap<String, i32>>,
    cache: SearchCache,
    /// Concurrency semaphores per indexer
    rate_limiters: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl IndexerManager {
    pub fn new(catalog: DefinitionCatalog, ctx: IndexerContext) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            ctx,
            indexers: RwLock::new(HashMap::new()),
            priorities: RwLock::new(HashMap::new()),
            cache: SearchCache::new(DEFAULT_CACHE_TTL),
            rate_limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = SearchCache::new(ttl);
        self
    }

    pub fn context(&self) -> &IndexerContext {
        &self.ctx
    }

    pub fn definition(&self, id: &str) -> Option<Arc<IndexerDefinition>> {
        self.catalog.read().get(id)
    }

    /// Replace the catalog. Already loaded indexers keep their definition.
    pub fn set_catalog(&self, catalog: DefinitionCatalog) {
        *self.catalog.write() = catalog;
    }

    /// Load every enabled config, logging (not failing on) bad ones.
    ///
    /// Returns how many indexers were loaded.
    pub fn load_indexers(&self, configs: impl IntoIterator<Item = IndexerInstanceConfig>) -> usize {
        let mut loaded = 0;
        for config in configs {
            if !config.enabled {
                continue;
            }
            let (id, name) = (config.id.clone(), config.name.clone());
            match self.load_indexer(config) {
                Ok(_) => loaded += 1,
                Err(e) => {
                    tracing::warn!(
                        indexer_id = %id,
                        indexer_name = %name,
                        error = %e,
                        "Failed to load indexer"
                    );
                }
            }
        }
        loaded
    }

    /// Instantiate one config against its definition
    pub fn load_indexer(&self, config: IndexerInstanceConfig) -> Result<Arc<CardigannIndexer>> {
        let definition = self
            .definition(&config.definition_id)
            .ok_or_else(|| anyhow!("Definition not found: {}", config.definition_id))?;

        let id = config.id.clone();
        let priority = config.priority;
        let indexer = Arc::new(
            CardigannIndexer::new(config, definition.clone(), self.ctx.clone())
                .with_context(|| format!("Failed to create indexer {}", id))?,
        );

        self.insert(indexer.clone());
        self.priorities.write().insert(id.clone(), priority);

        tracing::info!(
            indexer_id = %id,
            indexer_name = %indexer.name(),
            definition_id = %definition.id,
            "Loaded indexer"
        );
        Ok(indexer)
    }

    /// Register an indexer implementation directly
    pub fn insert(&self, indexer: Arc<dyn Indexer>) {
        let id = indexer.id().to_string();
        self.indexers.write().insert(id.clone(), indexer);
        self.rate_limiters
            .write()
            .insert(id, Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES)));
    }

    /// Unload an indexer
    pub fn unload_indexer(&self, id: &str) {
        self.indexers.write().remove(id);
        self.rate_limiters.write().remove(id);
        self.priorities.write().remove(id);
    }

    /// Get a loaded indexer by config id
    pub fn get_indexer(&self, id: &str) -> Option<Arc<dyn Indexer>> {
        self.indexers.read().get(id).cloned()
    }

    /// Get all loaded indexers, in priority order
    pub fn get_all_indexers(&self) -> Vec<Arc<dyn Indexer>> {
        self.ordered(|_| true)
    }

    fn ordered(&self, keep: impl Fn(&Arc<dyn Indexer>) -> bool) -> Vec<Arc<dyn Indexer>> {
        let priorities = self.priorities.read();
        let mut indexers: Vec<_> = self
            .indexers
            .read()
            .values()
            .filter(|idx| keep(idx))
            .cloned()
            .collect();
        indexers.sort_by(|a, b| {
            let pa = priorities.get(a.id()).copied().unwrap_or_default();
            let pb = priorities.get(b.id()).copied().unwrap_or_default();
            pa.cmp(&pb).then_with(|| a.id().cmp(b.id()))
        });
        indexers
    }

    /// Search across all loaded indexers that can handle the search
    pub async fn search_all(&self, criteria: &SearchCriteria) -> Vec<IndexerSearchResult> {
        let indexers = self.ordered(|idx| idx.can_handle(criteria));
        self.search_many(indexers, criteria).await
    }

    /// Search specific indexers
    pub async fn search_indexers(&self, indexer_ids: &[String], criteria: &SearchCriteria) -> Vec<IndexerSearchResult> {
        let indexers = self.ordered(|idx| indexer_ids.iter().any(|id| id == idx.id()) && idx.can_handle(criteria));
        self.search_many(indexers, criteria).await
    }

    async fn search_many(&self, indexers: Vec<Arc<dyn Indexer>>, criteria: &SearchCriteria) -> Vec<IndexerSearchResult> {
        let mut handles = Vec::with_capacity(indexers.len());
        for indexer in indexers {
            let criteria = criteria.clone();
            let cache = self.cache.clone();
            let rate_limiter = self.rate_limiters.read().get(indexer.id()).cloned();
            let health = self.ctx.health.clone();

            handles.push(tokio::spawn(async move {
                Self::search_single(indexer, &criteria, cache, rate_limiter, health).await
            }));
        }

        join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::error!(error = %e, "Indexer search task panicked");
                    None
                }
            })
            .collect()
    }

    /// Search a single indexer
    async fn search_single(
        indexer: Arc<dyn Indexer>,
        criteria: &SearchCriteria,
        cache: SearchCache,
        rate_limiter: Option<Arc<Semaphore>>,
        health: Arc<dyn HealthStore>,
    ) -> IndexerSearchResult {
        let start = Instant::now();
        let cache_key = format!("{}:{}", indexer.id(), criteria.cache_key());

        if criteria.cache {
            if let Some(cached) = cache.get(&cache_key) {
                tracing::debug!(indexer_id = %indexer.id(), count = cached.len(), "Serving search from cache");
                return IndexerSearchResult {
                    indexer_id: indexer.id().to_string(),
                    indexer_name: indexer.name().to_string(),
                    releases: cached,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    from_cache: true,
                    error: None,
                };
            }
        }

        let _permit = match rate_limiter {
            Some(ref limiter) => limiter.acquire().await.ok(),
            None => None,
        };

        match indexer.search(criteria).await {
            Ok(releases) => {
                record_health(&health, indexer.id(), None).await;
                if criteria.cache {
                    cache.insert(cache_key, releases.clone());
                }
                IndexerSearchResult {
                    indexer_id: indexer.id().to_string(),
                    indexer_name: indexer.name().to_string(),
                    releases,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    from_cache: false,
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(
                    indexer_id = indexer.id(),
                    indexer_name = indexer.name(),
                    error = %e,
                    "Search failed"
                );
                let message = e.user_facing_message();
                record_health(&health, indexer.id(), Some(&message)).await;

                IndexerSearchResult {
                    indexer_id: indexer.id().to_string(),
                    indexer_name: indexer.name().to_string(),
                    releases: vec![],
                    elapsed_ms: start.elapsed().as_millis() as u64,
                    from_cache: false,
                    error: Some(message),
                }
            }
        }
    }

    /// Test an indexer connection.
    ///
    /// The error carries the concise user-facing message.
    pub async fn test_indexer(&self, id: &str) -> Result<()> {
        let indexer = self
            .get_indexer(id)
            .ok_or_else(|| anyhow!("Indexer not loaded: {}", id))?;

        match indexer.test_connection().await {
            Ok(()) => {
                record_health(&self.ctx.health, id, None).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(indexer_id = %id, error = %e, "Indexer test failed");
                let message = e.user_facing_message();
                record_health(&self.ctx.health, id, Some(&message)).await;
                Err(anyhow!(message))
            }
        }
    }

    /// Fetch a release link through the owning indexer, with its session
    pub async fn download(&self, indexer_id: &str, link: &str) -> Result<DownloadContent> {
        let indexer = self
            .get_indexer(indexer_id)
            .ok_or_else(|| anyhow!("Indexer not loaded: {}", indexer_id))?;

        tracing::debug!(
            indexer_id = %indexer_id,
            indexer_name = %indexer.name(),
            "Downloading release via indexer"
        );
        indexer
            .download_content(link)
            .await
            .map_err(|e| {
                let message = e.user_facing_message();
                anyhow::Error::new(e).context(message)
            })
    }

    /// Download a release
    ///
    /// Convenience method that extracts the indexer_id and link from a ReleaseInfo
    pub async fn download_release(&self, release: &ReleaseInfo) -> Result<DownloadContent> {
        let indexer_id = release
            .indexer_id
            .as_ref()
            .ok_or_else(|| anyhow!("Release has no indexer_id"))?;

        let link = release
            .link
            .as_ref()
            .or(release.magnet_uri.as_ref())
            .ok_or_else(|| anyhow!("Release has no download link"))?;

        self.download(indexer_id, link).await
    }

    /// Drop expired cache entries
    pub fn cleanup_cache(&self) {
        self.cache.cleanup();
    }
}

async fn record_health(health: &Arc<dyn HealthStore>, indexer_id: &str, error: Option<&str>) {
    let mut record = match health.load_health(indexer_id).await {
        Ok(record) => record.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(indexer_id = %indexer_id, error = %e, "Failed to load indexer health");
            Default::default()
        }
    };
    match error {
        Some(message) => record.record_failure(Utc::now(), message),
        None => record.record_success(Utc::now()),
    }
    if let Err(e) = health.save_health(indexer_id, &record).await {
        tracing::warn!(indexer_id = %indexer_id, error = %e, "Failed to save indexer health");
    }
}

/// Simple in-memory search cache
#[derive(Clone)]
struct SearchCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

struct CacheEntry {
    releases: Vec<ReleaseInfo>,
    expires_at: Instant,
}

impl SearchCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<ReleaseInfo>> {
        let entries = self.entries.read();
        entries.get(key).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.releases.clone())
            } else {
                None
            }
        })
    }

    fn insert(&self, key: String, releases: Vec<ReleaseInfo>) {
        let mut entries = self.entries.write();
        entries.insert(
            key,
            CacheEntry {
                releases,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove expired entries
    fn cleanup(&self) {
        let mut entries = self.entries.write();
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
    }
}

impl std::fmt::Debug for IndexerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerManager")
            .field("indexers_count", &self.indexers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::http::{HttpClientConfig, IndexerHttpClient};
    use crate::indexer::{
        IndexerCapabilities, IndexerError, IndexerResult, Protocol, ResolvedDownload, TrackerType,
    };

    struct StubIndexer {
        id: String,
        caps: IndexerCapabilities,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl StubIndexer {
        fn new(id: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                caps: IndexerCapabilities::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Indexer for StubIndexer {
        fn id(&self) -> &str {
            &self.id
        }
        fn name(&self) -> &str {
            "Stub"
        }
        fn protocol(&self) -> Protocol {
            Protocol::Torrent
        }
        fn tracker_type(&self) -> TrackerType {
            TrackerType::Public
        }
        fn site_link(&self) -> &str {
            "https://stub.example/"
        }
        fn capabilities(&self) -> &IndexerCapabilities {
            &self.caps
        }

        async fn search(&self, criteria: &SearchCriteria) -> IndexerResult<Vec<ReleaseInfo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(IndexerError::Http {
                    status: 500,
                    host: "stub.example".into(),
                    retry_after: None,
                });
            }
            let title = criteria.query.clone().unwrap_or_default();
            Ok(vec![ReleaseInfo::new(title.clone(), title, Utc::now())])
        }

        async fn test_connection(&self) -> IndexerResult<()> {
            Ok(())
        }

        async fn download_url(&self, link: &str) -> IndexerResult<ResolvedDownload> {
            Ok(ResolvedDownload::Url(link.to_string()))
        }

        async fn download_content(&self, link: &str) -> IndexerResult<DownloadContent> {
            Ok(DownloadContent::Stream { url: link.to_string() })
        }
    }

    fn manager() -> IndexerManager {
        let http = IndexerHttpClient::new(HttpClientConfig::default()).unwrap();
        IndexerManager::new(DefinitionCatalog::new(), IndexerContext::new(Arc::new(http)))
    }

    #[tokio::test]
    async fn test_search_results_are_cached() {
        let manager = manager();
        let stub = StubIndexer::new("a", false);
        manager.insert(stub.clone());

        let criteria = SearchCriteria::search("ubuntu");
        let first = manager.search_all(&criteria).await;
        let second = manager.search_all(&criteria).await;

        assert_eq!(first.len(), 1);
        assert!(!first[0].from_cache);
        assert!(second[0].from_cache);
        assert_eq!(second[0].releases[0].title, "ubuntu");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_and_recorded() {
        let manager = manager();
        manager.insert(StubIndexer::new("bad", true));
        manager.insert(StubIndexer::new("good", false));

        let results = manager.search_all(&SearchCriteria::search("x")).await;
        assert_eq!(results.len(), 2);
        let bad = results.iter().find(|r| r.indexer_id == "bad").unwrap();
        assert_eq!(bad.error.as_deref(), Some("The indexer returned an HTTP 500 error"));

        let health = manager.context().health.load_health("bad").await.unwrap().unwrap();
        assert_eq!(health.error_count, 1);
        let health = manager.context().health.load_health("good").await.unwrap().unwrap();
        assert!(health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_searches_per_indexer_are_bounded() {
        let manager = Arc::new(manager());
        let stub = StubIndexer::new("a", false);
        manager.insert(stub.clone());

        let mut handles = Vec::new();
        for i in 0..6 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.search_all(&SearchCriteria::search(&format!("q{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 6);
        assert!(stub.max_in_flight.load(Ordering::SeqCst) <= MAX_CONCURRENT_SEARCHES);
    }

    #[tokio::test]
    async fn test_search_selected_indexers() {
        let manager = manager();
        manager.insert(StubIndexer::new("a", false));
        manager.insert(StubIndexer::new("b", false));

        let results = manager
            .search_indexers(&["b".to_string()], &SearchCriteria::search("x"))
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].indexer_id, "b");
    }

    #[tokio::test]
    async fn test_missing_definition_fails_to_load() {
        let manager = manager();
        let config = IndexerInstanceConfig {
            id: "x".into(),
            definition_id: "nope".into(),
            name: "X".into(),
            enabled: true,
            ..Default::default()
        };
        assert!(manager.load_indexer(config.clone()).is_err());
        assert_eq!(manager.load_indexers(vec![config]), 0);
        assert!(manager.test_indexer("x").await.is_err());
    }
}
