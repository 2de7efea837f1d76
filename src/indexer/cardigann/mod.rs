//! Cardigann definition interpreter
//!
//! [`CardigannIndexer`] drives one configured instance of a YAML definition:
//!
//! ```text
//! SearchCriteria -> RequestBuilder -> IndexerHttpClient -> ResponseParser -> Vec<ReleaseInfo>
//!                        (template)      (auth, anti-bot)     (selectors)
//! ```
//!
//! Sessions are kept in the shared [`CookieStore`](crate::session::CookieStore);
//! a response that looks logged out triggers exactly one re-login and retry.

pub mod content;
pub mod download;
pub mod login;
pub mod request;
pub mod response;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use encoding_rs::Encoding;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::{HttpResponse, RateLimit, RequestOptions};
use crate::indexer::categories::CategoryMapper;
use crate::indexer::definitions::{IndexerDefinition, settings::resolve_settings};
use crate::indexer::error::{IndexerError, IndexerResult};
use crate::indexer::protocol::handler_for;
use crate::indexer::template::TemplateEngine;
use crate::indexer::types::{IndexerCapabilities, Protocol, ReleaseInfo, SearchCriteria, TrackerType};
use crate::indexer::{Indexer, IndexerContext, IndexerInstanceConfig, ReleaseSource};

pub use content::{DownloadContent, fetch_content, magnet_info_hash, torrent_info_hash};
pub use download::{DownloadResolver, ResolvedDownload, magnet_from_hash};
pub use login::{LoginFlow, check_login_needed};
pub use request::{HttpRequestDescriptor, RequestBuilder, RequestBuilderOptions, SearchPlan};
pub use response::{ParsedResponse, ResponseParser};

/// Placeholder written over API keys in links handed out to callers
pub const REDACTED_KEY: &str = "(removed)";

/// Capabilities advertised by a definition's `caps` block
pub fn build_capabilities(definition: &IndexerDefinition, mapper: &CategoryMapper) -> IndexerCapabilities {
    let mut caps = IndexerCapabilities::new();
    caps.categories = mapper.mappings().to_vec();

    if let Some(ref block) = definition.caps {
        caps.supports_raw_search = block.allowrawsearch;
        for (mode, params) in &block.modes {
            let list = params.0.clone();
            match mode.to_lowercase().as_str() {
                "search" => caps.search_params = list,
                "tv-search" => caps.tv_search_params = list,
                "movie-search" => caps.movie_search_params = list,
                "music-search" | "audio-search" => caps.music_search_params = list,
                "book-search" => caps.book_search_params = list,
                other => debug!(definition_id = %definition.id, mode = %other, "Ignoring unknown search mode"),
            }
        }
    }
    caps
}

fn with_trailing_slash(link: &str) -> String {
    if link.ends_with('/') {
        link.to_string()
    } else {
        format!("{}/", link)
    }
}

pub struct CardigannIndexer {
    config: IndexerInstanceConfig,
    definition: Arc<IndexerDefinition>,
    ctx: IndexerContext,
    capabilities: IndexerCapabilities,
    mapper: CategoryMapper,
    /// Long-lived template scope: `.Config.*`, `.Today.*`
    engine: TemplateEngine,
    site_link: String,
    rate_limit: RateLimit,
    release_source: RwLock<Option<Arc<dyn ReleaseSource>>>,
    /// Serializes logins so concurrent searches do not log in twice
    login_lock: Mutex<()>,
    request_options: RequestBuilderOptions,
}

impl std::fmt::Debug for CardigannIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardigannIndexer")
            .field("id", &self.config.id)
            .field("definition", &self.definition.id)
            .field("site_link", &self.site_link)
            .finish_non_exhaustive()
    }
}

impl CardigannIndexer {
    pub fn new(
        config: IndexerInstanceConfig,
        definition: Arc<IndexerDefinition>,
        ctx: IndexerContext,
    ) -> IndexerResult<Self> {
        let encoding = definition
            .encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(encoding_rs::UTF_8);

        let site_link = config
            .base_url
            .clone()
            .or_else(|| config.settings.get("sitelink").cloned())
            .filter(|l| !l.trim().is_empty())
            .or_else(|| definition.links.first().cloned())
            .ok_or_else(|| IndexerError::InvalidUrl(format!("definition '{}' has no links", definition.id)))?;
        Url::parse(&site_link).map_err(|_| IndexerError::InvalidUrl(site_link.clone()))?;
        let site_link = with_trailing_slash(site_link.trim());

        let mut engine = TemplateEngine::new(encoding);
        for (name, value) in resolve_settings(&definition.settings, &config.settings) {
            engine.vars_mut().set(&format!("Config.{}", name), value);
        }
        engine.vars_mut().set("Config.sitelink", site_link.as_str());

        let mapper = definition
            .caps
            .as_ref()
            .map(CategoryMapper::from_caps)
            .unwrap_or_else(|| CategoryMapper::new(Vec::new()));
        let capabilities = build_capabilities(&definition, &mapper);

        let rate_limit = definition
            .request_delay
            .filter(|d| *d > 0.0)
            .map(RateLimit::from_request_delay)
            .unwrap_or(ctx.default_rate_limit);

        debug!(
            indexer_id = %config.id,
            definition_id = %definition.id,
            site = %site_link,
            encoding = encoding.name(),
            "Created Cardigann indexer"
        );

        Ok(Self {
            config,
            definition,
            ctx,
            capabilities,
            mapper,
            engine,
            site_link,
            rate_limit,
            release_source: RwLock::new(None),
            login_lock: Mutex::new(()),
            request_options: RequestBuilderOptions::default(),
        })
    }

    pub fn with_request_options(mut self, options: RequestBuilderOptions) -> Self {
        self.request_options = options;
        self
    }

    /// Serve searches from a structured store when the definition asks for it
    pub fn attach_source(&self, source: Arc<dyn ReleaseSource>) {
        *self.release_source.write() = Some(source);
    }

    pub fn definition(&self) -> &IndexerDefinition {
        &self.definition
    }

    pub fn config(&self) -> &IndexerInstanceConfig {
        &self.config
    }

    fn encoding(&self) -> &'static Encoding {
        self.engine.encoding()
    }

    fn requires_login(&self) -> bool {
        !matches!(self.definition.login_method(), None | Some("none"))
    }

    fn base_options(&self, cookies: HashMap<String, String>) -> RequestOptions {
        let mut opts = RequestOptions::get().with_cookies(cookies);
        opts.rate_limit = Some((self.config.id.clone(), self.rate_limit));
        opts.base_url = Some(self.site_link.clone());
        opts.mirrors = self.definition.links.clone();
        opts
    }

    fn request_builder(&self) -> RequestBuilder<'_> {
        RequestBuilder::new(
            &self.definition,
            &self.mapper,
            &self.engine,
            &self.site_link,
            &self.request_options,
        )
    }

    /// Cookies for the next request, logging in when there is no live session
    async fn ensure_logged_in(&self, force: bool) -> IndexerResult<HashMap<String, String>> {
        if !self.requires_login() {
            return Ok(self.ctx.cookies.cookies(&self.config.id).await);
        }

        let _guard = self.login_lock.lock().await;
        if !force {
            if let Some(record) = self.ctx.cookies.load(&self.config.id).await {
                if !record.cookies.is_empty() {
                    return Ok(record.cookies);
                }
            }
        } else {
            self.ctx.cookies.clear(&self.config.id).await;
        }

        let base = self.base_options(HashMap::new());
        let flow = LoginFlow::new(&self.definition, &self.engine, &self.ctx.http, &self.site_link, &base)
            .with_session_ttl(self.ctx.session_ttl);
        let record = flow.login().await.inspect_err(|e| {
            warn!(indexer_id = %self.config.id, error = %e, "Login failed");
        })?;
        info!(indexer_id = %self.config.id, "Logged in");

        let cookies = record.cookies.clone();
        self.ctx.cookies.save(&self.config.id, record).await;
        Ok(cookies)
    }

    async fn execute(&self, request: &HttpRequestDescriptor, cookies: &HashMap<String, String>) -> IndexerResult<HttpResponse> {
        let mut opts = self.base_options(cookies.clone());
        opts.method = request.method;
        opts.headers = request.headers.clone();
        opts.body = request.body.clone();
        self.ctx.http.request(&request.url, &opts).await
    }

    /// Send one request, re-logging once if the response looks logged out
    async fn fetch_page(
        &self,
        request: &HttpRequestDescriptor,
        cookies: &mut HashMap<String, String>,
        relogged: &mut bool,
    ) -> IndexerResult<String> {
        loop {
            let outcome = self.execute(request, cookies).await;
            let expired = match &outcome {
                Ok(r) => check_login_needed(&self.definition, &self.site_link, r, &r.text(self.encoding())),
                Err(e) => e.is_login_failure(),
            };
            if expired && self.requires_login() && !*relogged {
                info!(indexer_id = %self.config.id, "Session appears to have expired, logging in again");
                *relogged = true;
                *cookies = self.ensure_logged_in(true).await?;
                continue;
            }

            let response = outcome?;
            if !response.is_success() {
                return Err(IndexerError::Http {
                    status: response.status,
                    host: response.host(),
                    retry_after: None,
                });
            }
            self.ctx.cookies.merge(&self.config.id, &response.set_cookies).await;
            return Ok(response.text(self.encoding()));
        }
    }

    async fn search_http(&self, criteria: &SearchCriteria) -> IndexerResult<Vec<ReleaseInfo>> {
        let plan = match self.request_builder().plan(criteria) {
            Ok(plan) => plan,
            Err(IndexerError::NoRequests) => {
                debug!(indexer_id = %self.config.id, "No request applies to this search");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut cookies = self.ensure_logged_in(false).await?;
        let mut relogged = false;
        let parser = ResponseParser::new(&self.definition, &self.mapper, &self.site_link);
        let mut releases = Vec::new();
        let mut errors = Vec::new();

        for request in &plan.requests {
            let parsed = match self.fetch_page(request, &mut cookies, &mut relogged).await {
                Ok(body) => parser.parse(&body, request.response.as_ref(), &plan.engine),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(parsed) => {
                    if !parsed.warnings.is_empty() {
                        debug!(indexer_id = %self.config.id, skipped = parsed.warnings.len(), "Rows skipped");
                    }
                    releases.extend(parsed.releases);
                }
                Err(e) => {
                    warn!(indexer_id = %self.config.id, error = %e, "Search request failed");
                    errors.push(e);
                }
            }
        }

        if !errors.is_empty() && errors.len() == plan.requests.len() {
            if errors.len() == 1 {
                return Err(errors.remove(0));
            }
            return Err(IndexerError::AllRequestsFailed {
                count: errors.len(),
                errors: errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "),
            });
        }
        Ok(releases)
    }

    fn finish_releases(&self, releases: Vec<ReleaseInfo>) -> Vec<ReleaseInfo> {
        let handler = handler_for(self.definition.protocol);
        releases
            .into_iter()
            .filter_map(|mut release| {
                if let Some(reason) = handler.should_reject(&release) {
                    debug!(indexer_id = %self.config.id, title = %release.title, reason = %reason, "Rejected release");
                    return None;
                }
                release.indexer_id = Some(self.config.id.clone());
                release.indexer_name = Some(self.config.name.clone());
                release.link = release.link.map(|l| self.redact_url(&l));
                Some(release)
            })
            .collect()
    }

    fn api_key(&self) -> Option<String> {
        self.engine
            .vars()
            .get("Config.apikey")
            .map(|v| v.to_string())
            .filter(|k| !k.trim().is_empty())
    }

    fn rewrite_query(url: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
        let Ok(mut parsed) = Url::parse(url) else {
            return url.to_string();
        };
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| {
                let value = f(&v).unwrap_or_else(|| v.to_string());
                (k.into_owned(), value)
            })
            .collect();
        if pairs.is_empty() {
            return url.to_string();
        }
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
        parsed.to_string()
    }

    /// Replace the API key in a link with [`REDACTED_KEY`]
    pub fn redact_url(&self, url: &str) -> String {
        match self.api_key() {
            Some(key) if url.contains(&key) => {
                Self::rewrite_query(url, |v| (v == key).then(|| REDACTED_KEY.to_string()))
            }
            _ => url.to_string(),
        }
    }

    /// Put the API key back into a link produced by [`redact_url`](Self::redact_url)
    pub fn restore_url(&self, url: &str) -> String {
        match self.api_key() {
            Some(key) => Self::rewrite_query(url, |v| (v == REDACTED_KEY).then(|| key.clone())),
            None => url.to_string(),
        }
    }
}

#[async_trait]
impl Indexer for CardigannIndexer {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn protocol(&self) -> Protocol {
        self.definition.protocol
    }

    fn tracker_type(&self) -> TrackerType {
        TrackerType::parse(self.definition.tracker_type.as_deref())
    }

    fn site_link(&self) -> &str {
        &self.site_link
    }

    fn capabilities(&self) -> &IndexerCapabilities {
        &self.capabilities
    }

    async fn search(&self, criteria: &SearchCriteria) -> IndexerResult<Vec<ReleaseInfo>> {
        let source = self.release_source.read().clone();
        let releases = match source {
            Some(source) if self.definition.uses_store_source() => {
                debug!(indexer_id = %self.config.id, "Searching attached release source");
                source.query(&self.definition.id, &criteria.normalized()).await?
            }
            _ if self.definition.uses_store_source() => {
                return Err(IndexerError::Storage("no release source attached".to_string()));
            }
            _ => self.search_http(criteria).await?,
        };

        let releases = self.finish_releases(releases);
        info!(indexer_id = %self.config.id, count = releases.len(), "Search completed");
        Ok(releases)
    }

    async fn test_connection(&self) -> IndexerResult<()> {
        if self.definition.uses_store_source() {
            return match *self.release_source.read() {
                Some(_) => Ok(()),
                None => Err(IndexerError::Storage("no release source attached".to_string())),
            };
        }

        let plan = self.request_builder().plan(&SearchCriteria::default())?;
        let mut cookies = self.ensure_logged_in(false).await?;
        let mut relogged = false;
        let request = plan.requests.first().ok_or(IndexerError::NoRequests)?;
        let body = self.fetch_page(request, &mut cookies, &mut relogged).await?;
        let parsed = ResponseParser::new(&self.definition, &self.mapper, &self.site_link).parse(
            &body,
            request.response.as_ref(),
            &plan.engine,
        )?;
        info!(indexer_id = %self.config.id, results = parsed.releases.len(), "Connection test passed");
        Ok(())
    }

    async fn download_url(&self, link: &str) -> IndexerResult<ResolvedDownload> {
        let link = self.restore_url(link);
        let cookies = self.ensure_logged_in(false).await?;
        let base = self.base_options(cookies);
        DownloadResolver::new(&self.definition, &self.engine, &self.ctx.http, &self.site_link, &base)
            .resolve(&link)
            .await
    }

    async fn download_content(&self, link: &str) -> IndexerResult<DownloadContent> {
        let resolved = self.download_url(link).await?;
        match resolved {
            ResolvedDownload::Magnet(uri) => Ok(DownloadContent::Magnet {
                info_hash: magnet_info_hash(&uri),
                uri,
            }),
            ResolvedDownload::Url(url) => {
                let cookies = self.ctx.cookies.cookies(&self.config.id).await;
                let opts = self.base_options(cookies);
                fetch_content(&self.ctx.http, &url, &opts, self.definition.protocol).await
            }
        }
    }
}
