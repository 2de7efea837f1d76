//! Indexer engine
//!
//! Interprets Cardigann-style YAML definitions to search, authenticate
//! against and download from torrent trackers, Usenet gateways and streaming
//! catalogs without per-site code.
//!
//! # Architecture
//!
//! - [`Indexer`] trait: what every configured instance can do
//! - [`IndexerManager`]: registry and concurrent search orchestration
//! - [`cardigann`]: the definition interpreter
//! - [`definitions`], [`template`], [`filters`], [`selector`], [`categories`]:
//!   the declarative building blocks it is made of
//!
//! # Example
//!
//! ```ignore
//! let catalog = DefinitionCatalog::load_dir("definitions")?;
//! let manager = IndexerManager::new(catalog, ctx);
//! manager.load_indexer(instance_config)?;
//! let results = manager
//!     .search_all(&SearchCriteria::tv_search("My Show").with_season_episode(1, Some("5")))
//!     .await;
//! ```

pub mod cardigann;
pub mod categories;
pub mod definitions;
pub mod error;
pub mod filters;
pub mod manager;
pub mod protocol;
pub mod regex_cache;
pub mod selector;
pub mod template;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::http::{IndexerHttpClient, RateLimit};
use crate::session::{CookieStore, DEFAULT_SESSION_TTL, HealthStore, MemoryStore};

pub use cardigann::{CardigannIndexer, DownloadContent, ResolvedDownload};
pub use categories::{CategoryMapper, CategoryMapping};
pub use definitions::{DefinitionCatalog, IndexerDefinition, parse_definition};
pub use error::{IndexerError, IndexerResult, LoginError, SelectorError};
pub use manager::{IndexerManager, IndexerSearchResult};
pub use types::{
    EpisodeFormat, IndexerCapabilities, Protocol, ProtocolInfo, ReleaseInfo, SearchCriteria,
    SearchType, TrackerType,
};

/// Core trait for all indexer implementations
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Unique identifier for this indexer instance
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn protocol(&self) -> Protocol;

    fn tracker_type(&self) -> TrackerType;

    fn site_link(&self) -> &str;

    fn capabilities(&self) -> &IndexerCapabilities;

    /// Check if this indexer can handle the given search
    fn can_handle(&self, criteria: &SearchCriteria) -> bool {
        self.capabilities().supports(criteria.search_type)
    }

    async fn search(&self, criteria: &SearchCriteria) -> IndexerResult<Vec<ReleaseInfo>>;

    /// Perform at least one real request against the site
    async fn test_connection(&self) -> IndexerResult<()>;

    /// Resolve a release link to a fetchable URL or magnet
    async fn download_url(&self, link: &str) -> IndexerResult<ResolvedDownload>;

    /// Resolve and fetch a release link
    async fn download_content(&self, link: &str) -> IndexerResult<DownloadContent>;
}

/// Releases served from a structured store instead of scraping
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn query(&self, definition_id: &str, criteria: &SearchCriteria) -> IndexerResult<Vec<ReleaseInfo>>;
}

/// One configured instance of a definition, supplied by the host application
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexerInstanceConfig {
    pub id: String,
    pub definition_id: String,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// User values for the definition's `settings`
    #[serde(default)]
    pub settings: HashMap<String, String>,
    /// Replaces the definition's primary link
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

fn default_enabled() -> bool {
    true
}

/// Shared handles passed to every indexer
#[derive(Clone)]
pub struct IndexerContext {
    pub http: Arc<IndexerHttpClient>,
    pub cookies: Arc<CookieStore>,
    pub health: Arc<dyn HealthStore>,
    /// Used when a definition has no `requestDelay`
    pub default_rate_limit: RateLimit,
    /// Upper bound on how long a login is reused
    pub session_ttl: Duration,
}

impl IndexerContext {
    /// Context with in-memory session and health stores
    pub fn new(http: Arc<IndexerHttpClient>) -> Self {
        Self {
            http,
            cookies: Arc::new(CookieStore::in_memory()),
            health: Arc::new(MemoryStore::new()),
            default_rate_limit: RateLimit::default(),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_cookies(mut self, cookies: Arc<CookieStore>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_health(mut self, health: Arc<dyn HealthStore>) -> Self {
        self.health = health;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.default_rate_limit = limit;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }
}

impl std::fmt::Debug for IndexerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexerContext")
            .field("cookies", &self.cookies)
            .field("default_rate_limit", &self.default_rate_limit)
            .finish_non_exhaustive()
    }
}
