//! HTTP client shared by every indexer
//!
//! Wraps `reqwest` with the behaviour definitions rely on: per-indexer and
//! per-host rate limiting, manual redirect following with a per-chain cookie
//! jar (credentials never leave the starting host), retries of transient failures, mirror failover and anti-bot
//! challenge solving through the [`BrowserPool`].

pub mod antibot;
pub mod cookies;
pub mod rate_limit;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use encoding_rs::Encoding;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, HeaderMap, LOCATION, SET_COOKIE, USER_AGENT};
use reqwest::cookie::{CookieStore as _, Jar};
use reqwest::{Client, Method};
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::BrowserPool;
use crate::indexer::error::{IndexerError, IndexerResult};

pub use cookies::SetCookie;
pub use rate_limit::{HostRateLimitConfig, HostRateLimiter, IndexerRateLimiter, RateLimit};
pub use retry::{FailureKind, RetryConfig};

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Pause between the primary link failing and trying the next mirror
pub const MIRROR_FAILOVER_DELAY: Duration = Duration::from_secs(2);

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|m| m.trim().to_ascii_lowercase()) {
            Some(m) if m == "post" => HttpMethod::Post,
            _ => HttpMethod::Get,
        }
    }

    fn as_reqwest(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        }
    }
}

/// Request body, already encoded in the definition's charset
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// `application/x-www-form-urlencoded`
    Form(String),
    Json(serde_json::Value),
    Raw { content_type: String, data: String },
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Session cookies, including auth sentinel entries
    pub cookies: HashMap<String, String>,
    pub follow_redirects: bool,
    /// Indexer id and limit for the sliding-window limiter
    pub rate_limit: Option<(String, RateLimit)>,
    /// Base link the URL was built from; mirrors replace this prefix
    pub base_url: Option<String>,
    pub mirrors: Vec<String>,
    /// Do not hand a challenge to the browser pool
    pub skip_browser_solver: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            follow_redirects: true,
            ..Default::default()
        }
    }

    pub fn with_cookies(mut self, cookies: HashMap<String, String>) -> Self {
        self.cookies = cookies;
        self
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub final_url: String,
    /// Every cookie set along the redirect chain, in order
    pub set_cookies: Vec<SetCookie>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.header(LOCATION.as_str())
    }

    /// Decode the body with the definition's encoding
    pub fn text(&self, encoding: &'static Encoding) -> String {
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    pub fn host(&self) -> String {
        host_of(&self.final_url)
    }
}

/// Helper trait for inspecting statuses that might be retried
pub trait ResponseExt {
    /// Check if the response indicates rate limiting (429)
    fn is_rate_limited(&self) -> bool;

    /// Check if the response indicates a transient error that should be retried
    fn is_transient_error(&self) -> bool;
}

impl ResponseExt for HttpResponse {
    fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    fn is_transient_error(&self) -> bool {
        retry::is_transient_status(self.status)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub host_rate_limit: HostRateLimitConfig,
    /// Longest the sliding-window limiter may make a caller wait
    pub max_rate_limit_wait: Duration,
    pub mirror_failover_delay: Duration,
    pub browser_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            host_rate_limit: HostRateLimitConfig::default(),
            max_rate_limit_wait: Duration::from_secs(120),
            mirror_failover_delay: MIRROR_FAILOVER_DELAY,
            browser_timeout: Duration::from_secs(60),
        }
    }
}

/// Rate-limited, cookie-aware client used by every indexer
#[derive(Debug, Clone)]
pub struct IndexerHttpClient {
    client: Client,
    config: HttpClientConfig,
    indexer_limiter: Arc<IndexerRateLimiter>,
    host_limiter: Arc<HostRateLimiter>,
    browser_pool: Option<BrowserPool>,
}

pub fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

/// Rewrite `url` from `base` onto `mirror`
pub fn rebase_url(url: &str, base: &str, mirror: &str) -> Option<String> {
    let rest = url.strip_prefix(base.trim_end_matches('/'))?;
    Some(format!("{}{}", mirror.trim_end_matches('/'), rest))
}

impl IndexerHttpClient {
    pub fn new(config: HttpClientConfig) -> IndexerResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| IndexerError::Network {
                host: String::new(),
                message: format!("failed to build HTTP client: {}", e),
                timeout: false,
            })?;

        Ok(Self {
            client,
            host_limiter: Arc::new(HostRateLimiter::new(config.host_rate_limit.clone())),
            indexer_limiter: Arc::new(IndexerRateLimiter::new()),
            config,
            browser_pool: None,
        })
    }

    pub fn with_browser_pool(mut self, pool: BrowserPool) -> Self {
        self.browser_pool = Some(pool);
        self
    }

    /// Share limiters between clients
    pub fn with_limiters(mut self, indexer: Arc<IndexerRateLimiter>, host: Arc<HostRateLimiter>) -> Self {
        self.indexer_limiter = indexer;
        self.host_limiter = host;
        self
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    pub fn indexer_limiter(&self) -> &Arc<IndexerRateLimiter> {
        &self.indexer_limiter
    }

    /// Perform a request: rate limit, then primary URL and mirrors in turn
    pub async fn request(&self, url: &str, opts: &RequestOptions) -> IndexerResult<HttpResponse> {
        if let Some((key, limit)) = &opts.rate_limit {
            self.indexer_limiter
                .acquire(key, *limit, self.config.max_rate_limit_wait)
                .await?;
        }

        let mut candidates = vec![url.to_string()];
        if let Some(base) = &opts.base_url {
            candidates.extend(
                opts.mirrors
                    .iter()
                    .filter(|m| m.trim_end_matches('/') != base.trim_end_matches('/'))
                    .filter_map(|m| rebase_url(url, base, m)),
            );
        }

        let mut errors: Vec<String> = Vec::new();
        let mut last_error = None;
        for (i, candidate) in candidates.iter().enumerate() {
            if i > 0 {
                info!(
                    host = %host_of(candidate),
                    delay_ms = self.config.mirror_failover_delay.as_millis() as u64,
                    "Trying mirror"
                );
                tokio::time::sleep(self.config.mirror_failover_delay).await;
            }
            match self.request_with_retry(candidate, opts).await {
                Ok(response) => return Ok(response),
                Err(e) if should_fail_over(&e) => {
                    warn!(host = %host_of(candidate), error = %e, "Request failed");
                    errors.push(format!("{}: {}", host_of(candidate), e));
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(e) if candidates.len() == 1 => Err(e),
            _ => Err(IndexerError::AllRequestsFailed {
                count: candidates.len(),
                errors: errors.join("; "),
            }),
        }
    }

    async fn request_with_retry(&self, url: &str, opts: &RequestOptions) -> IndexerResult<HttpResponse> {
        let host = host_of(url);
        let response = retry::retry_async(
            || self.attempt(url, opts, &host),
            &self.config.retry,
            &host,
        )
        .await?;

        if antibot::detect(response.status, &response.headers, &response.body).is_none() {
            return Ok(response);
        }

        if opts.skip_browser_solver {
            return Err(IndexerError::AntiBotDetected { host });
        }
        self.bypass_challenge(url, opts, &host).await
    }

    /// One attempt: host limiter, send, follow redirects, classify status
    async fn attempt(&self, url: &str, opts: &RequestOptions, host: &str) -> IndexerResult<HttpResponse> {
        self.host_limiter.wait_for_permit(host).await;
        let response = self.send_following_redirects(url, opts).await?;

        if antibot::detect(response.status, &response.headers, &response.body).is_some() {
            debug!(host = %host, status = response.status, "Anti-bot challenge detected");
            return Ok(response);
        }
        if response.is_transient_error() {
            return Err(IndexerError::Http {
                status: response.status,
                host: host.to_string(),
                retry_after: retry::retry_after_from_headers(&response.headers),
            });
        }
        Ok(response)
    }

    async fn send_following_redirects(&self, url: &str, opts: &RequestOptions) -> IndexerResult<HttpResponse> {
        let origin = Url::parse(url).map_err(|_| IndexerError::InvalidUrl(url.to_string()))?;
        let origin_host = host_of(url);
        let jar = seed_jar(&opts.cookies, &origin);
        let mut set_cookies = Vec::new();
        let mut current = origin;
        let mut method = opts.method;
        let mut body = opts.body.clone();

        for _ in 0..=MAX_REDIRECTS {
            let host = current.host_str().unwrap_or_default().to_string();
            let credentials = (host == origin_host).then_some(&opts.cookies);
            let response = self
                .send_once(current.clone(), method, body.as_ref(), &jar, credentials, opts)
                .await?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();

            jar.set_cookies(&mut headers.get_all(SET_COOKIE).iter(), &current);
            if same_site(&host, &origin_host) {
                let now = Utc::now();
                set_cookies.extend(response.cookies().map(|c| SetCookie::from_response(&c, now)));
            } else if headers.contains_key(SET_COOKIE) {
                debug!(host = %host, "Ignoring cookies set by another site");
            }

            let location = headers
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let follow = opts.follow_redirects && (300..400).contains(&status) && status != 304;
            match location {
                Some(loc) if follow && !loc.starts_with("magnet:") => {
                    let next = current
                        .join(&loc)
                        .map_err(|_| IndexerError::InvalidUrl(loc.clone()))?;
                    debug!(status = status, to = %next.host_str().unwrap_or_default(), "Following redirect");
                    if status == 303 || (matches!(status, 301 | 302) && method == HttpMethod::Post) {
                        method = HttpMethod::Get;
                        body = None;
                    }
                    current = next;
                    continue;
                }
                _ => {}
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| IndexerError::from_reqwest(&host, &e))?;
            return Ok(HttpResponse {
                status,
                headers,
                body: bytes.to_vec(),
                final_url: current.to_string(),
                set_cookies,
            });
        }

        Err(IndexerError::Network {
            host: origin_host,
            message: "too many redirects".to_string(),
            timeout: false,
        })
    }

    /// Send one hop. `credentials` carries the session's auth sentinels and is
    /// only present while the chain stays on the host the request started on.
    async fn send_once(
        &self,
        mut target: Url,
        method: HttpMethod,
        body: Option<&RequestBody>,
        jar: &Jar,
        credentials: Option<&HashMap<String, String>>,
        opts: &RequestOptions,
    ) -> IndexerResult<reqwest::Response> {
        let host = target.host_str().unwrap_or_default().to_string();

        let mut extra_headers: Vec<(String, String)> = Vec::new();
        if let Some(session) = credentials {
            extra_headers.extend(opts.headers.iter().cloned());
            if let Some(creds) = session.get(cookies::BASIC_AUTH_SENTINEL) {
                extra_headers.push((
                    AUTHORIZATION.to_string(),
                    format!("Basic {}", BASE64.encode(creds.as_bytes())),
                ));
            }
            if let Some((name, value)) = session
                .get(cookies::API_KEY_HEADER_SENTINEL)
                .and_then(|v| v.split_once('='))
            {
                extra_headers.push((name.to_string(), value.to_string()));
            }
            if let Some((name, value)) = session
                .get(cookies::API_KEY_QUERY_SENTINEL)
                .and_then(|v| v.split_once('='))
                && !target.query_pairs().any(|(k, _)| k == name)
            {
                target.query_pairs_mut().append_pair(name, value);
            }
        }

        let cookie = jar.cookies(&target);
        let mut request = self
            .client
            .request(method.as_reqwest(), target)
            .header(USER_AGENT, &self.config.user_agent);

        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        for (name, value) in &extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        request = match body {
            Some(RequestBody::Form(encoded)) => request
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded.clone()),
            Some(RequestBody::Json(value)) => request.json(value),
            Some(RequestBody::Raw { content_type, data }) => request
                .header(CONTENT_TYPE, content_type.as_str())
                .body(data.clone()),
            None => request,
        };

        request
            .send()
            .await
            .map_err(|e| IndexerError::from_reqwest(&host, &e))
    }

    /// Solve the challenge in a browser and replay the request once
    async fn bypass_challenge(&self, url: &str, opts: &RequestOptions, host: &str) -> IndexerResult<HttpResponse> {
        let failed = |reason: String| IndexerError::AntiBotBypassFailed {
            host: host.to_string(),
            reason,
        };

        let Some(pool) = &self.browser_pool else {
            warn!(host = %host, "Anti-bot challenge but no browser pool configured");
            return Err(failed("no browser available".to_string()));
        };

        let mut lease = pool
            .acquire(self.config.browser_timeout)
            .await
            .map_err(|e| failed(e.to_string()))?;
        info!(host = %host, "Solving anti-bot challenge in browser");

        let solution = match lease.solve(url, &self.config.user_agent).await {
            Ok(solution) => {
                pool.release(lease, true).await;
                solution
            }
            Err(e) => {
                pool.release(lease, false).await;
                warn!(host = %host, error = %e, "Browser could not solve challenge");
                return Err(failed(e.to_string()));
            }
        };

        let mut retry_opts = opts.clone();
        retry_opts.skip_browser_solver = true;
        retry_opts.rate_limit = None;
        retry_opts.cookies.extend(solution.cookies.clone());

        let mut response = retry::retry_async(
            || self.attempt(url, &retry_opts, host),
            &self.config.retry,
            host,
        )
        .await?;
        if antibot::detect(response.status, &response.headers, &response.body).is_some() {
            return Err(failed("challenge still present after solving".to_string()));
        }

        let mut solved: Vec<SetCookie> = solution
            .cookies
            .into_iter()
            .map(|(name, value)| SetCookie {
                expires: solution.cookie_expiry.get(&name).copied(),
                name,
                value,
            })
            .collect();
        solved.sort_by(|a, b| a.name.cmp(&b.name));
        solved.append(&mut response.set_cookies);
        response.set_cookies = solved;
        Ok(response)
    }
}

/// Cookie jar for one redirect chain, holding the session's cookies as
/// host-only cookies of the first URL
fn seed_jar(session: &HashMap<String, String>, origin: &Url) -> Jar {
    let jar = Jar::default();
    for (name, value) in session.iter().filter(|(name, _)| !cookies::is_sentinel(name)) {
        jar.add_cookie_str(&format!("{}={}; Path=/", name, value), origin);
    }
    jar
}

/// Hosts that share a session: equal, or one a subdomain of the other
fn same_site(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
        || a.ends_with(&format!(".{}", b))
        || b.ends_with(&format!(".{}", a))
}

fn should_fail_over(err: &IndexerError) -> bool {
    match err {
        IndexerError::Network { .. } => true,
        IndexerError::Http { status, .. } => *status >= 500,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_rebase_url() {
        assert_eq!(
            rebase_url("https://a.example/browse.php?q=x", "https://a.example/", "https://b.example/").as_deref(),
            Some("https://b.example/browse.php?q=x")
        );
        assert_eq!(rebase_url("https://c.example/x", "https://a.example/", "https://b.example/"), None);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(HttpMethod::parse(Some("POST")), HttpMethod::Post);
        assert_eq!(HttpMethod::parse(Some("get")), HttpMethod::Get);
        assert_eq!(HttpMethod::parse(None), HttpMethod::Get);
    }

    #[test]
    fn test_same_site() {
        assert!(same_site("tracker.example", "tracker.example"));
        assert!(same_site("login.tracker.example", "tracker.example"));
        assert!(!same_site("cdn.example", "tracker.example"));
        assert!(!same_site("nottracker.example", "tracker.example"));
    }

    fn session() -> HashMap<String, String> {
        HashMap::from([
            ("uid".to_string(), "secret-session".to_string()),
            (cookies::BASIC_AUTH_SENTINEL.to_string(), "user:pass".to_string()),
            (cookies::API_KEY_QUERY_SENTINEL.to_string(), "apikey=k3y".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_redirect_to_other_host_drops_credentials() {
        let tracker = MockServer::start().await;
        let cdn = MockServer::start().await;
        let cdn_url = cdn.uri().replace("127.0.0.1", "localhost");

        Mock::given(method("GET"))
            .and(path("/download.php"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("{}/file.torrent", cdn_url).as_str())
                    .insert_header("set-cookie", "last_dl=1; Path=/"),
            )
            .mount(&tracker)
            .await;
        Mock::given(method("GET"))
            .and(path("/file.torrent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "tracking=abc")
                    .set_body_string("d4:infod4:name1:aee"),
            )
            .mount(&cdn)
            .await;

        let client = IndexerHttpClient::new(HttpClientConfig::default()).unwrap();
        let mut opts = RequestOptions::get().with_cookies(session());
        opts.headers.push(("X-Api-Key".to_string(), "k3y".to_string()));

        let response = client
            .request(&format!("{}/download.php", tracker.uri()), &opts)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.final_url.contains("localhost"));

        let first = &tracker.received_requests().await.unwrap()[0];
        assert_eq!(first.headers.get("cookie").unwrap(), "uid=secret-session");
        assert!(first.headers.get("authorization").is_some());
        assert!(first.url.query().unwrap_or_default().contains("apikey=k3y"));

        let hop = &cdn.received_requests().await.unwrap()[0];
        assert!(hop.headers.get("cookie").is_none());
        assert!(hop.headers.get("authorization").is_none());
        assert!(hop.headers.get("x-api-key").is_none());
        assert!(hop.url.query().is_none());

        let names: Vec<&str> = response.set_cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["last_dl"]);
    }

    #[tokio::test]
    async fn test_same_host_redirect_keeps_cookies() {
        let tracker = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login.php"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/index.php")
                    .append_header("set-cookie", "pass=abc; Path=/; Max-Age=3600")
                    .append_header("set-cookie", "old=gone; Max-Age=0"),
            )
            .mount(&tracker)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.php"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&tracker)
            .await;

        let client = IndexerHttpClient::new(HttpClientConfig::default()).unwrap();
        let mut opts = RequestOptions::get().with_cookies(HashMap::from([
            ("uid".to_string(), "42".to_string()),
            ("old".to_string(), "1".to_string()),
        ]));
        opts.method = HttpMethod::Post;

        let before = Utc::now();
        let response = client
            .request(&format!("{}/login.php", tracker.uri()), &opts)
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        let requests = tracker.received_requests().await.unwrap();
        let cookie = requests[1].headers.get("cookie").unwrap().to_str().unwrap();
        assert!(cookie.contains("uid=42"));
        assert!(cookie.contains("pass=abc"));
        assert!(!cookie.contains("old="));

        let pass = response.set_cookies.iter().find(|c| c.name == "pass").unwrap();
        assert!(pass.expires.unwrap() > before + chrono::Duration::minutes(59));
        let old = response.set_cookies.iter().find(|c| c.name == "old").unwrap();
        assert!(old.is_deletion(Utc::now()));
    }

    #[test]
    fn test_fail_over_policy() {
        assert!(should_fail_over(&IndexerError::Network {
            host: "h".into(),
            message: "m".into(),
            timeout: true
        }));
        assert!(!should_fail_over(&IndexerError::Http {
            status: 404,
            host: "h".into(),
            retry_after: None
        }));
    }
}
