//! Resolution of a release link into something a client can fetch
//!
//! Most definitions link straight to a `.torrent` or `.nzb`; the ones with a
//! `download` block need a details page scraped first. Resolution order:
//!
//! 1. optional `before` request (its path may itself be scraped)
//! 2. `infohash` block, turned into a magnet with public trackers
//! 3. `selectors` in order; URLs are checked for a bencoded body unless
//!    `testlinktorrent: false`

use scraper::Html;
use tracing::{debug, warn};
use url::Url;

use crate::http::{HttpMethod, HttpResponse, IndexerHttpClient, RequestBody, RequestOptions};
use crate::indexer::definitions::{DownloadBlock, IndexerDefinition, SelectorBlock};
use crate::indexer::error::{IndexerError, IndexerResult};
use crate::indexer::selector::{self, SelectorOutcome};
use crate::indexer::template::TemplateEngine;

use super::request::{encode_params, resolve_url};

/// Trackers appended to magnets built from a scraped info hash
pub const PUBLIC_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.demonii.com:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://open.stealth.si:80/announce",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedDownload {
    Url(String),
    Magnet(String),
}

impl ResolvedDownload {
    pub fn as_str(&self) -> &str {
        match self {
            ResolvedDownload::Url(u) | ResolvedDownload::Magnet(u) => u,
        }
    }
}

/// Build a magnet URI from an info hash and display name
pub fn magnet_from_hash(hash: &str, title: &str) -> String {
    let mut magnet = format!(
        "magnet:?xt=urn:btih:{}&dn={}",
        hash.trim().to_lowercase(),
        urlencoding::encode(title.trim())
    );
    for tracker in PUBLIC_TRACKERS {
        magnet.push_str("&tr=");
        magnet.push_str(&urlencoding::encode(tracker));
    }
    magnet
}

/// Evaluate a selector block against an HTML page, synchronously
fn scrape(body: &str, block: &SelectorBlock, engine: &TemplateEngine) -> IndexerResult<Option<String>> {
    let doc = Html::parse_document(body);
    let outcome = selector::select_html(doc.root_element(), block, false, engine)?;
    Ok(match outcome {
        SelectorOutcome::Value(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    })
}

pub struct DownloadResolver<'a> {
    definition: &'a IndexerDefinition,
    engine: &'a TemplateEngine,
    http: &'a IndexerHttpClient,
    site_link: &'a str,
    base: &'a RequestOptions,
}

impl<'a> DownloadResolver<'a> {
    /// `base` carries the session cookies, rate limit and mirrors
    pub fn new(
        definition: &'a IndexerDefinition,
        engine: &'a TemplateEngine,
        http: &'a IndexerHttpClient,
        site_link: &'a str,
        base: &'a RequestOptions,
    ) -> Self {
        Self {
            definition,
            engine,
            http,
            site_link,
            base,
        }
    }

    pub async fn resolve(&self, url: &str) -> IndexerResult<ResolvedDownload> {
        if url.starts_with("magnet:") {
            return Ok(ResolvedDownload::Magnet(url.to_string()));
        }
        let Some(ref download) = self.definition.download else {
            return Ok(ResolvedDownload::Url(url.to_string()));
        };

        let link = resolve_url(self.site_link, url)?;
        let engine = self.download_engine(&link);

        let before = match download.before {
            Some(_) => Some(self.before_request(download, &link, &engine).await?),
            None => None,
        };

        if download.infohash.is_none() && download.selectors.is_empty() {
            return Ok(ResolvedDownload::Url(link.to_string()));
        }

        let page = self.fetch(download, link.as_str(), &engine).await?;
        let page_body = page.text(engine.encoding());
        let before_body = before.as_ref().map(|r| r.text(engine.encoding()));

        if let Some(ref infohash) = download.infohash {
            let body = match (&before_body, infohash.usebeforeresponse) {
                (Some(b), true) => b.as_str(),
                _ => page_body.as_str(),
            };
            let hash = scrape(body, &infohash.hash, &engine)?;
            let title = scrape(body, &infohash.title, &engine)?;
            match (hash, title) {
                (Some(hash), Some(title)) => {
                    debug!(indexer_id = %self.definition.id, "Built magnet from info hash");
                    return Ok(ResolvedDownload::Magnet(magnet_from_hash(&hash, &title)));
                }
                _ => debug!(indexer_id = %self.definition.id, "Info hash selectors did not match"),
            }
        }

        let mut tried = Vec::new();
        for sel in &download.selectors {
            let (body, base_url) = match (&before_body, sel.usebeforeresponse, &before) {
                (Some(b), true, Some(r)) => (b.as_str(), r.final_url.as_str()),
                _ => (page_body.as_str(), page.final_url.as_str()),
            };
            tried.push(sel.selector.clone());
            let Some(href) = scrape(body, &sel.as_block(), &engine)? else {
                continue;
            };
            if href.starts_with("magnet:") {
                return Ok(ResolvedDownload::Magnet(href));
            }
            let target = Url::parse(base_url)
                .and_then(|b| b.join(&href))
                .map_err(|_| IndexerError::InvalidUrl(href.clone()))?;
            if self.definition.testlinktorrent == Some(false) {
                return Ok(ResolvedDownload::Url(target.to_string()));
            }
            match self.serves_torrent(download, target.as_str()).await {
                Ok(true) => return Ok(ResolvedDownload::Url(target.to_string())),
                Ok(false) => debug!(selector = %sel.selector, "Download candidate is not a torrent"),
                Err(e) => warn!(selector = %sel.selector, error = %e, "Download candidate failed"),
            }
        }

        Err(IndexerError::DownloadResolution(if tried.is_empty() {
            "no download selector produced a link".to_string()
        } else {
            tried.join(", ")
        }))
    }

    /// Engine with `.DownloadUri.*` describing the link being resolved
    fn download_engine(&self, link: &Url) -> TemplateEngine {
        let mut engine = self.engine.clone();
        let vars = engine.vars_mut();
        vars.set("DownloadUri.AbsoluteUri", link.as_str());
        vars.set("DownloadUri.AbsolutePath", link.path());
        let path_and_query = match link.query() {
            Some(q) => format!("{}?{}", link.path(), q),
            None => link.path().to_string(),
        };
        vars.set("DownloadUri.PathAndQuery", path_and_query);
        for (key, value) in link.query_pairs() {
            vars.set(&format!("DownloadUri.Query.{}", key), value.to_string());
        }
        engine
    }

    fn options(&self, download: &DownloadBlock, engine: &TemplateEngine) -> RequestOptions {
        let mut opts = self.base.clone();
        opts.follow_redirects = true;
        opts.body = None;
        opts.headers.extend(
            download
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), engine.expand(v, false))),
        );
        opts
    }

    async fn before_request(&self, download: &DownloadBlock, link: &Url, engine: &TemplateEngine) -> IndexerResult<HttpResponse> {
        let Some(ref before) = download.before else {
            return Err(IndexerError::DownloadResolution("missing before block".to_string()));
        };

        let path = match before.pathselector {
            Some(ref block) => {
                let page = self.fetch(download, link.as_str(), engine).await?;
                scrape(&page.text(engine.encoding()), block, engine)?.ok_or_else(|| {
                    IndexerError::DownloadResolution(format!("before.pathselector '{}'", block.describe()))
                })?
            }
            None => engine.expand(before.path.as_deref().unwrap_or_default(), false),
        };
        let mut url = Url::parse(link.as_str())
            .and_then(|b| b.join(&path))
            .map_err(|_| IndexerError::InvalidUrl(path.clone()))?;

        let inputs: Vec<(String, String)> = before
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), engine.expand(v, false)))
            .collect();
        let mut opts = self.options(download, engine);
        opts.method = HttpMethod::parse(before.method.as_deref());
        let encoded = encode_params(&inputs, engine.encoding());
        if !inputs.is_empty() {
            match opts.method {
                HttpMethod::Post => opts.body = Some(RequestBody::Form(encoded)),
                HttpMethod::Get => {
                    let joined = match url.query() {
                        Some(q) if !q.is_empty() => format!("{}&{}", q, encoded),
                        _ => encoded,
                    };
                    url.set_query(Some(&joined));
                }
            }
        }

        debug!(indexer_id = %self.definition.id, method = ?opts.method, "Sending download before request");
        self.http.request(url.as_str(), &opts).await
    }

    async fn fetch(&self, download: &DownloadBlock, url: &str, engine: &TemplateEngine) -> IndexerResult<HttpResponse> {
        let mut opts = self.options(download, engine);
        opts.method = HttpMethod::parse(download.method.as_deref());
        let response = self.http.request(url, &opts).await?;
        if !response.is_success() {
            return Err(IndexerError::Http {
                status: response.status,
                host: response.host(),
                retry_after: None,
            });
        }
        Ok(response)
    }

    /// Whether `url` serves a bencoded body
    async fn serves_torrent(&self, download: &DownloadBlock, url: &str) -> IndexerResult<bool> {
        let opts = self.options(download, self.engine);
        let response = self.http.request(url, &opts).await?;
        if response.is_redirect() && response.location().is_some_and(|l| l.starts_with("magnet:")) {
            return Ok(true);
        }
        Ok(response.is_success() && response.body.first() == Some(&b'd'))
    }
}
