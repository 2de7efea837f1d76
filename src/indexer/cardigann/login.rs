//! Login methods
//!
//! | method   | behaviour                                                        |
//! |----------|------------------------------------------------------------------|
//! | `post`   | form-encoded POST of `inputs` to `path`                          |
//! | `form`   | fetch `path`, harvest the form, overlay inputs, submit           |
//! | `get`    | GET `path` with `inputs` in the query string                     |
//! | `oneurl` | GET `path` followed by the expanded `inputs.oneurl`              |
//! | `cookie` | user-supplied cookie string, or `login.cookies` templates        |
//! | `basic`  | HTTP basic auth from `username`/`password`                       |
//! | `apikey` | API key sent as a header or query parameter                      |
//! | `none`   | no authentication                                                |
//!
//! Request-based methods never follow redirects automatically: cookies set on
//! the 3xx are captured, then the redirect is followed exactly once.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use crate::http::cookies::{self, API_KEY_HEADER_SENTINEL, API_KEY_QUERY_SENTINEL, BASIC_AUTH_SENTINEL, SetCookie};
use crate::http::{HttpMethod, HttpResponse, IndexerHttpClient, RequestBody, RequestOptions, host_of};
use crate::indexer::definitions::{ErrorBlock, IndexerDefinition, LoginBlock};
use crate::indexer::error::{IndexerError, IndexerResult, LoginError};
use crate::indexer::selector::{self, SelectorOutcome};
use crate::indexer::template::TemplateEngine;
use crate::session::{CookieRecord, DEFAULT_SESSION_TTL};

use super::request::{encode_params, resolve_url};
use super::response::find_html_error;

/// A login form scraped from the login page
#[derive(Debug, Clone, PartialEq)]
struct FormSubmission {
    action: String,
    method: HttpMethod,
    inputs: Vec<(String, String)>,
    query: Vec<(String, String)>,
}

pub struct LoginFlow<'a> {
    definition: &'a IndexerDefinition,
    engine: &'a TemplateEngine,
    http: &'a IndexerHttpClient,
    site_link: &'a str,
    base: &'a RequestOptions,
    session_ttl: Duration,
}

fn set_input(inputs: &mut Vec<(String, String)>, name: &str, value: String) {
    match inputs.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value,
        None => inputs.push((name.to_string(), value)),
    }
}

fn cookie_map(set: &[SetCookie]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    cookies::merge_set_cookies(&mut map, set, Utc::now());
    map
}

/// Whether a host belongs to the definition (primary link or a mirror)
fn is_site_host(definition: &IndexerDefinition, site_link: &str, host: &str) -> bool {
    host == host_of(site_link)
        || definition
            .links
            .iter()
            .chain(definition.legacylinks.iter())
            .any(|l| host_of(l) == host)
}

/// Decide whether a search response shows the session has lapsed.
///
/// True on HTTP 401/403, a redirect that left the site, or a page that lacks
/// the configured logged-in marker (`login.test.selector`).
pub fn check_login_needed(definition: &IndexerDefinition, site_link: &str, response: &HttpResponse, body: &str) -> bool {
    let Some(ref login) = definition.login else {
        return false;
    };
    if matches!(response.status, 401 | 403) {
        return true;
    }
    if !is_site_host(definition, site_link, &response.host()) {
        debug!(host = %response.host(), "Search redirected off-site");
        return true;
    }
    let method = definition.login_method().unwrap_or("none");
    if matches!(method, "none" | "basic" | "apikey") {
        return false;
    }

    let looks_like_html = body.trim_start().starts_with('<');
    match login.test.as_ref().and_then(|t| t.selector.as_deref()) {
        Some(sel) if looks_like_html => {
            let doc = Html::parse_document(body);
            selector::select_all(doc.root_element(), sel).map_or(false, |hits| hits.is_empty())
        }
        _ => false,
    }
}

impl<'a> LoginFlow<'a> {
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
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    fn block(&self) -> Option<&'a LoginBlock> {
        self.definition.login.as_ref()
    }

    fn config(&self, name: &str) -> Option<String> {
        self.engine
            .vars()
            .get(&format!("Config.{}", name))
            .map(|v| v.to_string())
            .filter(|v| !v.trim().is_empty())
    }

    fn require(&self, name: &str) -> IndexerResult<String> {
        self.config(name).ok_or_else(|| {
            LoginError::MissingCredential {
                name: name.to_string(),
            }
            .into()
        })
    }

    fn expand_inputs(&self, inputs: &[(String, String)]) -> Vec<(String, String)> {
        inputs
            .iter()
            .map(|(k, v)| (k.clone(), self.engine.expand(v, false)))
            .collect()
    }

    fn options(&self, method: HttpMethod, cookies: HashMap<String, String>) -> RequestOptions {
        let mut opts = self.base.clone();
        opts.method = method;
        opts.follow_redirects = false;
        opts.cookies = cookies;
        opts.body = None;
        if let Some(login) = self.block() {
            opts.headers.extend(self.expand_inputs(&login.headers));
        }
        opts
    }

    /// Run the definition's login method and return the resulting session
    pub async fn login(&self) -> IndexerResult<CookieRecord> {
        let Some(login) = self.block() else {
            return Ok(CookieRecord::default());
        };
        let method = login.method.as_deref().unwrap_or("post").to_lowercase();
        info!(indexer_id = %self.definition.id, method = %method, "Logging in");

        let mut record = match method.as_str() {
            "none" => return Ok(CookieRecord::default()),
            "cookie" => self.cookie_login(login)?,
            "basic" => {
                let user = self.require("username")?;
                let pass = self.require("password")?;
                let mut record = CookieRecord::new(HashMap::new());
                record
                    .cookies
                    .insert(BASIC_AUTH_SENTINEL.to_string(), format!("{}:{}", user, pass));
                record
            }
            "apikey" => self.apikey_login(login)?,
            "post" | "get" | "oneurl" => self.request_login(login, &method).await?,
            "form" => self.form_login(login).await?,
            other => {
                return Err(LoginError::UnsupportedMethod {
                    method: other.to_string(),
                }
                .into());
            }
        };

        if record.cookies.is_empty() {
            warn!(indexer_id = %self.definition.id, "Login produced no cookies");
        }
        self.test(&record.cookies).await?;
        record.expire_session_after(self.session_ttl, Utc::now());
        Ok(record)
    }

    fn cookie_login(&self, login: &LoginBlock) -> IndexerResult<CookieRecord> {
        let mut jar = HashMap::new();
        if login.cookies.is_empty() {
            let raw = self.require("cookie")?;
            jar.extend(cookies::parse_cookie_string(&raw));
        } else {
            for template in &login.cookies {
                let expanded = self.engine.expand(template, false);
                for (name, value) in cookies::parse_cookie_string(&expanded) {
                    if value.is_empty() {
                        return Err(LoginError::MissingCredential { name }.into());
                    }
                    jar.insert(name, value);
                }
            }
        }
        if jar.is_empty() {
            return Err(LoginError::MissingCredential {
                name: "cookie".to_string(),
            }
            .into());
        }
        Ok(CookieRecord::new(jar))
    }

    fn apikey_login(&self, login: &LoginBlock) -> IndexerResult<CookieRecord> {
        let (sentinel, name, value) = if let Some((header, template)) = login.headers.first() {
            (API_KEY_HEADER_SENTINEL, header.clone(), self.engine.expand(template, false))
        } else if let Some((param, template)) = login.inputs.first() {
            (API_KEY_QUERY_SENTINEL, param.clone(), self.engine.expand(template, false))
        } else {
            (API_KEY_QUERY_SENTINEL, "apikey".to_string(), self.require("apikey")?)
        };
        if value.trim().is_empty() {
            return Err(LoginError::MissingCredential {
                name: "apikey".to_string(),
            }
            .into());
        }
        let mut record = CookieRecord::new(HashMap::new());
        record
            .cookies
            .insert(sentinel.to_string(), format!("{}={}", name, value.trim()));
        Ok(record)
    }

    async fn request_login(&self, login: &LoginBlock, method: &str) -> IndexerResult<CookieRecord> {
        let path = self.engine.expand(login.path.as_deref().unwrap_or_default(), false);
        let inputs = self.expand_inputs(&login.inputs);
        let encoding = self.engine.encoding();

        let (url, opts) = match method {
            "post" => {
                let mut opts = self.options(HttpMethod::Post, HashMap::new());
                opts.body = Some(RequestBody::Form(encode_params(&inputs, encoding)));
                (resolve_url(self.site_link, &path)?, opts)
            }
            "get" => {
                let mut url = resolve_url(self.site_link, &path)?;
                let query = encode_params(&inputs, encoding);
                if !query.is_empty() {
                    let joined = match url.query() {
                        Some(q) if !q.is_empty() => format!("{}&{}", q, query),
                        _ => query,
                    };
                    url.set_query(Some(&joined));
                }
                (url, self.options(HttpMethod::Get, HashMap::new()))
            }
            _ => {
                let one = inputs
                    .iter()
                    .find(|(k, _)| k == "oneurl")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default();
                let url = resolve_url(self.site_link, &format!("{}{}", path, one))?;
                (url, self.options(HttpMethod::Get, HashMap::new()))
            }
        };

        let response = self.http.request(url.as_str(), &opts).await?;
        self.finish(response, Vec::new()).await
    }

    async fn form_login(&self, login: &LoginBlock) -> IndexerResult<CookieRecord> {
        let path = self.engine.expand(login.path.as_deref().unwrap_or_default(), false);
        let login_url = resolve_url(self.site_link, &path)?;
        let mut page_opts = self.options(HttpMethod::Get, HashMap::new());
        page_opts.follow_redirects = true;
        let page = self.http.request(login_url.as_str(), &page_opts).await?;
        let set_cookies = page.set_cookies.clone();
        let body = page.text(self.engine.encoding());

        let form = self.harvest_form(login, &body, &page.final_url)?;
        let mut action = Url::parse(&form.action).map_err(|_| IndexerError::InvalidUrl(form.action.clone()))?;
        if let Some(ref submit) = login.submitpath {
            action = resolve_url(self.site_link, &self.engine.expand(submit, false))?;
        }
        if !form.query.is_empty() {
            let extra = encode_params(&form.query, self.engine.encoding());
            let joined = match action.query() {
                Some(q) if !q.is_empty() => format!("{}&{}", q, extra),
                _ => extra,
            };
            action.set_query(Some(&joined));
        }

        let mut opts = self.options(form.method, cookie_map(&set_cookies));
        let encoded = encode_params(&form.inputs, self.engine.encoding());
        match form.method {
            HttpMethod::Post => opts.body = Some(RequestBody::Form(encoded)),
            HttpMethod::Get => {
                let joined = match action.query() {
                    Some(q) if !q.is_empty() => format!("{}&{}", q, encoded),
                    _ => encoded,
                };
                action.set_query(Some(&joined));
            }
        }

        debug!(indexer_id = %self.definition.id, fields = form.inputs.len(), "Submitting login form");
        let response = self.http.request(action.as_str(), &opts).await?;
        self.finish(response, set_cookies).await
    }

    fn harvest_form(&self, login: &LoginBlock, body: &str, page_url: &str) -> IndexerResult<FormSubmission> {
        let doc = Html::parse_document(body);
        let root = doc.root_element();

        if let Some(sel) = login.captcha.as_ref().and_then(|c| c.selector.as_deref()) {
            if !selector::select_all(root, sel)?.is_empty() {
                return Err(LoginError::CaptchaRequired.into());
            }
        }

        let form_selector = login.form.as_deref().unwrap_or("form");
        let form = selector::select_all(root, form_selector)?
            .into_iter()
            .next()
            .ok_or_else(|| LoginError::FormNotFound {
                selector: form_selector.to_string(),
            })?;
        if form.html().to_ascii_lowercase().contains("captcha") {
            return Err(LoginError::CaptchaRequired.into());
        }

        let mut inputs = Vec::new();
        for el in selector::select_all(form, "input, select, textarea")? {
            let attrs = el.value();
            let Some(name) = attrs.attr("name").filter(|n| !n.is_empty()) else {
                continue;
            };
            if attrs.attr("disabled").is_some() {
                continue;
            }
            let value = match attrs.name() {
                "select" => selector::select_all(el, "option[selected]")?
                    .into_iter()
                    .chain(selector::select_all(el, "option")?)
                    .next()
                    .and_then(|o| o.value().attr("value").map(str::to_string))
                    .unwrap_or_default(),
                "textarea" => el.text().collect::<String>(),
                _ => {
                    let kind = attrs.attr("type").unwrap_or("text").to_ascii_lowercase();
                    match kind.as_str() {
                        "checkbox" | "radio" if attrs.attr("checked").is_none() => continue,
                        "checkbox" | "radio" => attrs.attr("value").unwrap_or("on").to_string(),
                        "image" | "reset" | "button" => continue,
                        _ => attrs.attr("value").unwrap_or_default().to_string(),
                    }
                }
            };
            set_input(&mut inputs, name, value);
        }

        for (name, value) in self.expand_inputs(&login.inputs) {
            set_input(&mut inputs, &name, value);
        }
        for (name, block) in &login.selectorinputs {
            if let SelectorOutcome::Value(v) = selector::select_html(root, block, true, self.engine)? {
                set_input(&mut inputs, name, v);
            }
        }
        let mut query = Vec::new();
        for (name, block) in &login.getselectorinputs {
            if let SelectorOutcome::Value(v) = selector::select_html(root, block, true, self.engine)? {
                set_input(&mut query, name, v);
            }
        }

        let action = match form.value().attr("action").map(str::trim).filter(|a| !a.is_empty()) {
            Some(a) => Url::parse(page_url)
                .and_then(|base| base.join(a))
                .map(|u| u.to_string())
                .map_err(|_| IndexerError::InvalidUrl(a.to_string()))?,
            None => page_url.to_string(),
        };
        let method = match form.value().attr("method") {
            Some(m) => HttpMethod::parse(Some(m)),
            None => HttpMethod::Post,
        };

        Ok(FormSubmission {
            action,
            method,
            inputs,
            query,
        })
    }

    /// Handle a login response: 401, one redirect hop, error selectors
    async fn finish(&self, response: HttpResponse, mut set_cookies: Vec<SetCookie>) -> IndexerResult<CookieRecord> {
        if response.status == 401 {
            return Err(LoginError::Unauthorized.into());
        }
        set_cookies.extend(response.set_cookies.iter().cloned());

        let mut page = response;
        if page.is_redirect() {
            if let Some(location) = page.location().map(str::to_string) {
                let next = Url::parse(&page.final_url)
                    .and_then(|base| base.join(&location))
                    .map_err(|_| IndexerError::InvalidUrl(location.clone()))?;
                let host = next.host_str().unwrap_or_default().to_string();
                if !is_site_host(self.definition, self.site_link, &host) {
                    return Err(LoginError::CrossHostRedirect { host }.into());
                }
                let opts = self.options(HttpMethod::Get, cookie_map(&set_cookies));
                page = self.http.request(next.as_str(), &opts).await?;
                if page.status == 401 {
                    return Err(LoginError::Unauthorized.into());
                }
                set_cookies.extend(page.set_cookies.iter().cloned());
            }
        }

        let body = page.text(self.engine.encoding());
        if let Some(message) = self.login_error(&body, &page.final_url) {
            return Err(LoginError::SiteError { message }.into());
        }

        Ok(CookieRecord::from_set_cookies(&set_cookies, Utc::now()))
    }

    fn login_error(&self, body: &str, url: &str) -> Option<String> {
        let login = self.block()?;
        let blocks: Vec<ErrorBlock> = login
            .error
            .iter()
            .filter(|b| b.path.as_deref().is_none_or(|p| url.contains(p)))
            .cloned()
            .collect();
        if blocks.is_empty() {
            return None;
        }
        let doc = Html::parse_document(body);
        find_html_error(doc.root_element(), &blocks, self.engine)
    }

    /// Verify a session against the `test` block. No block means success.
    pub async fn test(&self, cookies: &HashMap<String, String>) -> IndexerResult<()> {
        let Some(test) = self.block().and_then(|l| l.test.as_ref()) else {
            return Ok(());
        };
        let path = self.engine.expand(test.path.as_deref().unwrap_or_default(), false);
        let url = resolve_url(self.site_link, &path)?;
        let mut opts = self.options(HttpMethod::Get, cookies.clone());
        opts.follow_redirects = true;
        let response = self.http.request(url.as_str(), &opts).await?;

        if response.status == 401 {
            return Err(LoginError::Unauthorized.into());
        }
        let host = response.host();
        if !is_site_host(self.definition, self.site_link, &host) {
            return Err(LoginError::CrossHostRedirect { host }.into());
        }
        if let Some(ref sel) = test.selector {
            let body = response.text(self.engine.encoding());
            let doc = Html::parse_document(&body);
            if selector::select_all(doc.root_element(), sel)?.is_empty() {
                return Err(LoginError::TestFailed.into());
            }
        }
        debug!(indexer_id = %self.definition.id, "Login test passed");
        Ok(())
    }
}
