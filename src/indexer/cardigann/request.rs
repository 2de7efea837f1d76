//! Search request construction
//!
//! Turns a [`SearchCriteria`] into the concrete HTTP requests a definition
//! describes: one per selected search path, with inputs expanded, mode
//! parameters filtered and the body encoded in the site's charset.

use tracing::debug;
use url::Url;

use crate::http::{HttpMethod, RequestBody};
use crate::indexer::categories::{CategoryMapper, cats};
use crate::indexer::definitions::{IndexerDefinition, ResponseBlock, SearchPath};
use crate::indexer::error::{IndexerError, IndexerResult};
use crate::indexer::filters::{apply_filters, form_urlencode};
use crate::indexer::template::{TemplateEngine, Value};
use crate::indexer::types::{SearchCriteria, SearchType};

/// Parameters that are never filtered by mode
pub const ALWAYS_ALLOWED_PARAMS: &[&str] = &["t", "apikey", "limit", "cat", "offset"];

/// Torznab query parameters a mode may or may not advertise
const TORZNAB_PARAMS: &[&str] = &[
    "q", "imdbid", "tmdbid", "tvdbid", "tvmazeid", "traktid", "rid", "season", "ep", "year",
    "genre", "artist", "album", "label", "track", "author", "title", "publisher",
];

/// Input names that carry search content
pub const DEFAULT_SEARCH_PARAMS: &[&str] = &[
    "q", "query", "search", "searchstr", "search_string", "searchtext", "keywords", "term",
    "name", "s", "imdbid", "imdb", "tmdbid", "tvdbid", "tvmazeid", "traktid", "season", "ep",
    "year", "genre", "artist", "album", "label", "track", "author", "title", "publisher",
];

/// Template variables whose presence makes an input carry search content
const QUERY_VARIABLES: &[&str] = &[
    ".Keywords",
    ".Query.Q",
    ".Query.Keywords",
    ".Query.IMDBID",
    ".Query.TMDBID",
    ".Query.TVDBID",
    ".Query.TVMazeID",
    ".Query.TraktID",
    ".Query.Artist",
    ".Query.Album",
    ".Query.Author",
    ".Query.Title",
];

#[derive(Debug, Clone)]
pub struct RequestBuilderOptions {
    /// Input names that count as a meaningful search parameter
    pub search_params: Vec<String>,
}

impl Default for RequestBuilderOptions {
    fn default() -> Self {
        Self {
            search_params: DEFAULT_SEARCH_PARAMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RequestBuilderOptions {
    fn is_search_param(&self, name: &str) -> bool {
        self.search_params.iter().any(|p| p.eq_ignore_ascii_case(name))
    }
}

/// A fully built search request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestDescriptor {
    pub url: String,
    pub method: HttpMethod,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    /// Decoded parameters, in send order (query string for GET, form for POST)
    pub params: Vec<(String, String)>,
    /// How the response should be parsed
    pub response: Option<ResponseBlock>,
}

impl HttpRequestDescriptor {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Requests for one search plus the template scope they were built with.
///
/// The response parser evaluates field templates against the same scope.
#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub engine: TemplateEngine,
    pub criteria: SearchCriteria,
    pub requests: Vec<HttpRequestDescriptor>,
}

pub struct RequestBuilder<'a> {
    definition: &'a IndexerDefinition,
    categories: &'a CategoryMapper,
    base: &'a TemplateEngine,
    site_link: &'a str,
    options: &'a RequestBuilderOptions,
}

fn default_category(search_type: SearchType) -> Option<i32> {
    match search_type {
        SearchType::Basic => None,
        SearchType::Movie => Some(cats::MOVIES),
        SearchType::Tv => Some(cats::TV),
        SearchType::Music => Some(cats::AUDIO),
        SearchType::Book => Some(cats::BOOKS),
    }
}

fn references_query(template: &str) -> bool {
    QUERY_VARIABLES.iter().any(|v| template.contains(v))
}

/// Resolve a (possibly relative) path against the site link
pub fn resolve_url(site_link: &str, path: &str) -> IndexerResult<Url> {
    let path = path.trim();
    if path.starts_with("http://") || path.starts_with("https://") {
        return Url::parse(path).map_err(|_| IndexerError::InvalidUrl(path.to_string()));
    }
    Url::parse(site_link)
        .and_then(|base| base.join(path))
        .map_err(|_| IndexerError::InvalidUrl(path.to_string()))
}

/// Encode `key=value` pairs in the site's charset
pub fn encode_params(params: &[(String, String)], encoding: &'static encoding_rs::Encoding) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", form_urlencode(k, encoding), form_urlencode(v, encoding)))
        .collect::<Vec<_>>()
        .join("&")
}

impl<'a> RequestBuilder<'a> {
    pub fn new(
        definition: &'a IndexerDefinition,
        categories: &'a CategoryMapper,
        base: &'a TemplateEngine,
        site_link: &'a str,
        options: &'a RequestBuilderOptions,
    ) -> Self {
        Self {
            definition,
            categories,
            base,
            site_link,
            options,
        }
    }

    pub fn build_search_requests(&self, criteria: &SearchCriteria) -> IndexerResult<Vec<HttpRequestDescriptor>> {
        Ok(self.plan(criteria)?.requests)
    }

    /// Build every request for a search. Fails with [`IndexerError::NoRequests`]
    /// when no candidate path survives filtering.
    pub fn plan(&self, criteria: &SearchCriteria) -> IndexerResult<SearchPlan> {
        let mut criteria = criteria.normalized();
        if criteria.categories.is_empty() {
            if let Some(cat) = default_category(criteria.search_type) {
                criteria.categories = vec![cat];
            }
        }

        let mut engine = self.base.clone();
        self.set_query_variables(&mut engine, &criteria);

        let has_content = !criteria.keywords().is_empty() || criteria.is_id_search();
        let mut requests = Vec::new();
        for path in self.candidate_paths(&criteria) {
            if let Some(request) = self.build_path(&engine, &path, &criteria, has_content)? {
                requests.push(request);
            }
        }

        if requests.is_empty() {
            return Err(IndexerError::NoRequests);
        }
        Ok(SearchPlan {
            engine,
            criteria,
            requests,
        })
    }

    fn mode_supports(&self, search_type: SearchType, param: &str) -> bool {
        let has_modes = self
            .definition
            .caps
            .as_ref()
            .is_some_and(|caps| !caps.modes.is_empty());
        if !has_modes {
            return true;
        }
        match self
            .definition
            .mode(search_type.mode_name())
            .or_else(|| self.definition.mode("search"))
        {
            Some(mode) => mode.supports(param),
            None => false,
        }
    }

    fn param_allowed(&self, name: &str, search_type: SearchType) -> bool {
        let lower = name.to_ascii_lowercase();
        if ALWAYS_ALLOWED_PARAMS.contains(&lower.as_str()) {
            return true;
        }
        if TORZNAB_PARAMS.contains(&lower.as_str()) {
            return lower == "q" || self.mode_supports(search_type, &lower);
        }
        true
    }

    fn set_query_variables(&self, engine: &mut TemplateEngine, criteria: &SearchCriteria) {
        let ctx = engine.filter_context();
        let raw_keywords = criteria.keywords();
        let keywords = {
            let expander = engine.clone();
            apply_filters(
                &self.definition.search.keywordsfilters,
                raw_keywords.clone(),
                &ctx,
                |arg| expander.expand(arg, false),
            )
        };

        let t = criteria.search_type;
        let native = self.categories.map_to_tracker(&criteria.categories);
        let supports = |param: &str| self.mode_supports(t, param);

        let vars = engine.vars_mut();
        vars.reset_query();
        vars.set_query("Keywords", keywords);
        vars.set_query("Query.Keywords", raw_keywords);
        vars.set_query("Query.Q", criteria.query.clone().unwrap_or_default());
        vars.set_query("Query.Type", t.torznab_name());
        vars.set_query("Categories", Value::from(native));
        vars.set_query(
            "Query.Categories",
            Value::from(
                criteria
                    .categories
                    .iter()
                    .map(|c| c.to_string())
                    .collect::<Vec<_>>(),
            ),
        );
        if let Some(limit) = criteria.limit {
            vars.set_query("Query.Limit", limit);
        }
        if let Some(offset) = criteria.offset {
            vars.set_query("Query.Offset", offset);
        }
        vars.set_query("Query.Page", criteria.page());

        if supports("imdbid") {
            vars.set_query("Query.IMDBID", criteria.imdb_id.clone());
            vars.set_query("Query.IMDBIDShort", criteria.imdb_id_short());
        }
        if supports("tmdbid") {
            vars.set_query("Query.TMDBID", criteria.tmdb_id);
        }
        if supports("tvdbid") {
            vars.set_query("Query.TVDBID", criteria.tvdb_id);
        }
        if supports("tvmazeid") {
            vars.set_query("Query.TVMazeID", criteria.tvmaze_id);
        }
        if supports("traktid") {
            vars.set_query("Query.TraktID", criteria.trakt_id);
        }
        if supports("season") {
            vars.set_query("Query.Season", criteria.season);
        }
        if supports("ep") {
            vars.set_query("Query.Ep", criteria.episode.clone());
        }
        if supports("year") {
            vars.set_query("Query.Year", criteria.year);
        }
        if supports("genre") {
            vars.set_query("Query.Genre", criteria.genre.clone());
        }
        for (param, var, value) in [
            ("artist", "Query.Artist", &criteria.artist),
            ("album", "Query.Album", &criteria.album),
            ("label", "Query.Label", &criteria.label),
            ("track", "Query.Track", &criteria.track),
            ("author", "Query.Author", &criteria.author),
            ("title", "Query.Title", &criteria.title),
            ("publisher", "Query.Publisher", &criteria.publisher),
        ] {
            if supports(param) {
                vars.set_query(var, value.clone());
            }
        }
    }

    /// Candidate paths in send order.
    ///
    /// Typed searches use the category-scoped paths that match the request,
    /// falling back to unscoped paths. Basic searches use unscoped paths,
    /// falling back to scoped ones.
    fn candidate_paths(&self, criteria: &SearchCriteria) -> Vec<SearchPath> {
        let (scoped, generic): (Vec<SearchPath>, Vec<SearchPath>) = self
            .definition
            .search_paths()
            .into_iter()
            .partition(|p| !p.categories.is_empty());

        let matching: Vec<SearchPath> = scoped
            .iter()
            .filter(|p| {
                self.categories
                    .matches_path_categories(&p.categories, &criteria.categories)
            })
            .cloned()
            .collect();

        if criteria.search_type == SearchType::Basic {
            if !generic.is_empty() {
                generic
            } else if !matching.is_empty() {
                matching
            } else {
                scoped
            }
        } else if !matching.is_empty() {
            matching
        } else if !generic.is_empty() {
            generic
        } else {
            scoped
        }
    }

    fn build_path(
        &self,
        engine: &TemplateEngine,
        path: &SearchPath,
        criteria: &SearchCriteria,
        has_content: bool,
    ) -> IndexerResult<Option<HttpRequestDescriptor>> {
        let search = &self.definition.search;
        let encoding = engine.encoding();

        let mut inputs: Vec<(String, String)> = if path.inheritinputs {
            search.inputs.clone()
        } else {
            Vec::new()
        };
        for (name, template) in &path.inputs {
            match inputs.iter_mut().find(|(n, _)| n == name) {
                Some(slot) => slot.1 = template.clone(),
                None => inputs.push((name.clone(), template.clone())),
            }
        }

        let mut params = Vec::new();
        let mut raw = None;
        let mut meaningful = false;
        for (name, template) in &inputs {
            let value = engine.expand(template, false);
            if name == "$raw" {
                let value = value.trim_start_matches('&').to_string();
                if !value.is_empty() {
                    meaningful |= references_query(template);
                    raw = Some(value);
                }
                continue;
            }
            if !self.param_allowed(name, criteria.search_type) {
                debug!(param = %name, mode = criteria.search_type.mode_name(), "Dropping unsupported parameter");
                continue;
            }
            if !value.is_empty() && (self.options.is_search_param(name) || references_query(template)) {
                meaningful = true;
            }
            params.push((name.clone(), value));
        }

        if has_content && !meaningful && !references_query(&path.path) {
            debug!(path = %path.path, "Skipping path with no search parameter");
            return Ok(None);
        }

        let expanded_path = engine.expand(&path.path, true);
        let mut url = resolve_url(self.site_link, &expanded_path)?;
        let method = HttpMethod::parse(path.method.as_deref().or(search.method.as_deref()));

        let headers: Vec<(String, String)> = search
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), engine.expand(v, false)))
            .collect();

        let mut all_params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let body = match method {
            HttpMethod::Get => {
                let mut query = url.query().unwrap_or_default().to_string();
                for part in [Some(encode_params(&params, encoding)), raw.clone()]
                    .into_iter()
                    .flatten()
                    .filter(|p| !p.is_empty())
                {
                    if !query.is_empty() {
                        query.push('&');
                    }
                    query.push_str(&part);
                }
                url.set_query((!query.is_empty()).then_some(query.as_str()));
                None
            }
            HttpMethod::Post => Some(self.post_body(engine, &params, raw.as_deref())),
        };
        all_params.extend(params);

        Ok(Some(HttpRequestDescriptor {
            url: url.to_string(),
            method,
            headers,
            body,
            params: all_params,
            response: path.response.clone(),
        }))
    }

    fn post_body(&self, engine: &TemplateEngine, params: &[(String, String)], raw: Option<&str>) -> RequestBody {
        if let Some(template) = &self.definition.search.body {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&engine.expand_json(template)) {
                return RequestBody::Json(json);
            }
            return RequestBody::Raw {
                content_type: "text/plain; charset=utf-8".to_string(),
                data: engine.expand(template, false),
            };
        }

        let form = encode_params(params, engine.encoding());
        match raw {
            Some(raw) => {
                let data = if form.is_empty() {
                    raw.to_string()
                } else {
                    format!("{}&{}", form, raw)
                };
                RequestBody::Raw {
                    content_type: "application/x-www-form-urlencoded".to_string(),
                    data,
                }
            }
            None => RequestBody::Form(form),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::definitions::parse_definition;
    use crate::indexer::types::EpisodeFormat;
    use pretty_assertions::assert_eq;

    const SITE: &str = "https://tracker.example/";

    fn definition(search: &str) -> IndexerDefinition {
        let yaml = format!(
            r#"
id: example
name: Example
links: ["{SITE}"]
caps:
  categorymappings:
    - {{id: 1, cat: Movies, desc: Movies}}
    - {{id: 5, cat: TV, desc: TV}}
    - {{id: 9, cat: Other, default: true}}
  modes:
    search: [q]
    tv-search: [q, season, ep]
    movie-search: [q, imdbid]
{search}
  rows:
    selector: tr
  fields:
    title:
      selector: a
"#
        );
        parse_definition(&yaml).unwrap()
    }

    fn build(def: &IndexerDefinition, criteria: &SearchCriteria) -> IndexerResult<Vec<HttpRequestDescriptor>> {
        let mapper = CategoryMapper::from_caps(def.caps.as_ref().unwrap());
        let mut engine = TemplateEngine::default();
        engine.vars_mut().set("Config.sitelink", SITE);
        let options = RequestBuilderOptions::default();
        RequestBuilder::new(def, &mapper, &engine, SITE, &options).build_search_requests(criteria)
    }

    #[test]
    fn test_tv_keywords_in_path_template() {
        let def = definition("search:\n  path: \"search?q={{ .Keywords }}\"");
        let criteria = SearchCriteria::tv_search("My Show")
            .with_season_episode(1, Some("5"))
            .with_episode_format(EpisodeFormat::Standard);

        let requests = build(&def, &criteria).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].param("q"), Some("My Show S01E05"));
        assert_eq!(requests[0].url, "https://tracker.example/search?q=My+Show+S01E05");
    }

    #[test]
    fn test_tv_keywords_in_inputs() {
        let def = definition(
            "search:\n  path: browse.php\n  inputs:\n    q: \"{{ .Keywords }}\"\n    cat: \"{{ join .Categories \\\",\\\" }}\"",
        );
        let criteria = SearchCriteria::tv_search("My Show").with_season_episode(1, Some("5"));
        let requests = build(&def, &criteria).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].param("q"), Some("My Show S01E05"));
        assert_eq!(requests[0].param("cat"), Some("5"));
        assert_eq!(requests[0].method, HttpMethod::Get);
    }

    #[test]
    fn test_unsupported_mode_param_is_dropped() {
        let def = definition(
            "search:\n  path: browse.php\n  inputs:\n    q: \"{{ .Keywords }}\"\n    imdbid: \"{{ .Query.IMDBID }}\"\n    season: \"{{ .Query.Season }}\"",
        );
        let criteria = SearchCriteria::movie_search("Film").with_imdb("tt0111161");
        let requests = build(&def, &criteria).unwrap();
        assert_eq!(requests[0].param("imdbid"), Some("tt0111161"));
        assert_eq!(requests[0].param("season"), None);
    }

    #[test]
    fn test_path_without_search_param_is_skipped() {
        let def = definition(
            r#"search:
  paths:
    - path: top10.php
      inputs:
        sort: seeders
    - path: browse.php
      inputs:
        search: "{{ .Keywords }}""#,
        );
        let requests = build(&def, &SearchCriteria::search("ubuntu")).unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.starts_with("https://tracker.example/browse.php"));
    }

    #[test]
    fn test_empty_search_keeps_browse_paths() {
        let def = definition("search:\n  path: browse.php\n  inputs:\n    sort: added");
        let requests = build(&def, &SearchCriteria::default()).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].param("sort"), Some("added"));
    }

    #[test]
    fn test_no_requests_error() {
        let def = definition("search:\n  path: top10.php\n  inputs:\n    sort: seeders");
        let err = build(&def, &SearchCriteria::search("ubuntu")).unwrap_err();
        assert!(matches!(err, IndexerError::NoRequests));
    }

    #[test]
    fn test_typed_search_prefers_scoped_paths() {
        let def = definition(
            r#"search:
  paths:
    - path: movies.php
      categories: [Movies]
    - path: tv.php
      categories: [5]
    - path: all.php
  inputs:
    q: "{{ .Keywords }}""#,
        );
        let tv = build(&def, &SearchCriteria::tv_search("show")).unwrap();
        assert_eq!(tv.len(), 1);
        assert!(tv[0].url.contains("tv.php"));

        let basic = build(&def, &SearchCriteria::search("show")).unwrap();
        assert_eq!(basic.len(), 1);
        assert!(basic[0].url.contains("all.php"));
    }

    #[test]
    fn test_post_form_body_and_raw() {
        let def = definition(
            "search:\n  path: ajax.php\n  method: post\n  inputs:\n    search: \"{{ .Keywords }}\"\n    $raw: \"&c[]=1&c[]=2\"",
        );
        let requests = build(&def, &SearchCriteria::search("a b")).unwrap();
        assert_eq!(requests[0].method, HttpMethod::Post);
        assert_eq!(
            requests[0].body,
            Some(RequestBody::Raw {
                content_type: "application/x-www-form-urlencoded".to_string(),
                data: "search=a+b&c[]=1&c[]=2".to_string(),
            })
        );
    }

    #[test]
    fn test_json_body() {
        let def = definition(
            "search:\n  path: api/search\n  method: post\n  body: '{\"query\": \"{{ .Keywords }}\"}'",
        );
        let requests = build(&def, &SearchCriteria::search("ubuntu")).unwrap();
        assert_eq!(
            requests[0].body,
            Some(RequestBody::Json(serde_json::json!({"query": "ubuntu"})))
        );

        let requests = build(&def, &SearchCriteria::search(r#"say "hi" \ bye"#)).unwrap();
        assert_eq!(
            requests[0].body,
            Some(RequestBody::Json(serde_json::json!({"query": r#"say "hi" \ bye"#})))
        );
    }

    #[test]
    fn test_plain_text_body_is_not_json_escaped() {
        let def = definition("search:
  path: api/search
  method: post
  body: 'q={{ .Keywords }}'");
        let requests = build(&def, &SearchCriteria::search(r#"a "b""#)).unwrap();
        assert_eq!(
            requests[0].body,
            Some(RequestBody::Raw {
                content_type: "text/plain; charset=utf-8".to_string(),
                data: r#"q=a "b""#.to_string(),
            })
        );
    }

    #[test]
    fn test_keywordsfilters_apply_before_expansion() {
        let def = definition(
            r#"search:
  path: browse.php
  keywordsfilters:
    - name: re_replace
      args: ["\\s+", "."]
  inputs:
    q: "{{ .Keywords }}""#,
        );
        let requests = build(&def, &SearchCriteria::search("the big show")).unwrap();
        assert_eq!(requests[0].param("q"), Some("the.big.show"));
    }

    #[test]
    fn test_charset_aware_escaping() {
        let params = vec![("q".to_string(), "Привет".to_string())];
        let encoded = encode_params(&params, encoding_rs::WINDOWS_1251);
        assert_eq!(encoded, "q=%CF%F0%E8%E2%E5%F2");
    }
}
