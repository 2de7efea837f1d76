//! Search response parsing
//!
//! Applies a definition's `rows` and `fields` blocks to a response body and
//! produces normalized [`ReleaseInfo`] records. A row that fails to extract is
//! skipped with a warning; it never aborts the batch.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::indexer::categories::CategoryMapper;
use crate::indexer::definitions::{ErrorBlock, IndexerDefinition, ResponseBlock, RowsBlock, SelectorBlock};
use crate::indexer::error::{IndexerError, IndexerResult, SelectorError};
use crate::indexer::filters::{apply_filters, parse_fuzzy_date};
use crate::indexer::selector::{self, SelectorOutcome};
use crate::indexer::template::{TemplateEngine, Value};
use crate::indexer::types::{ProtocolInfo, ReleaseInfo};

use super::request::resolve_url;

/// Releases extracted from one response, plus per-row problems
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub releases: Vec<ReleaseInfo>,
    pub warnings: Vec<String>,
}

/// Parse a human readable size ("1.5 GB", "700MiB", "1,024 KB") to bytes
pub fn parse_size(size_str: &str) -> Option<i64> {
    let size_str = size_str.trim().replace(',', "").to_uppercase();
    if size_str.is_empty() {
        return None;
    }
    if let Ok(bytes) = size_str.parse::<f64>() {
        return Some(bytes as i64);
    }

    let split = size_str
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(size_str.len());
    let (num, unit) = size_str.split_at(split);
    let num = num.trim().parse::<f64>().ok()?;
    let multiplier = match unit.trim() {
        "B" | "BYTES" => 1.0,
        "KB" | "KIB" => 1024.0,
        "MB" | "MIB" => 1024.0 * 1024.0,
        "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TB" | "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((num * multiplier) as i64)
}

fn parse_int(value: &str) -> Option<i32> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | ' ' | '.'))
        .collect();
    cleaned.parse::<i32>().ok()
}

fn parse_float(value: &str) -> Option<f64> {
    value.trim().replace(',', ".").parse::<f64>().ok()
}

fn parse_id(value: &str) -> Option<i64> {
    let digits: String = value
        .trim()
        .trim_start_matches("tt")
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<i64>().ok().filter(|&n| n > 0)
}

/// Evaluate a definition's `error` blocks against a page.
///
/// Returns the extracted message of the first block whose selector matches.
pub fn find_html_error(root: ElementRef<'_>, blocks: &[ErrorBlock], engine: &TemplateEngine) -> Option<String> {
    for block in blocks {
        let Some(ref sel) = block.selector else {
            continue;
        };
        let Some(hit) = selector::select_all(root, sel).ok()?.into_iter().next() else {
            continue;
        };
        let message = match block.message {
            Some(ref msg) => selector::select_html(root, msg, false, engine)
                .ok()
                .and_then(SelectorOutcome::into_option),
            None => selector::element_text(hit, None).ok(),
        };
        return Some(
            message
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("error selector matched: {}", sel)),
        );
    }
    None
}

fn find_json_error(root: &JsonValue, blocks: &[ErrorBlock], engine: &TemplateEngine) -> Option<String> {
    for block in blocks {
        let Some(ref sel) = block.selector else {
            continue;
        };
        let found = selector::json_path(root, sel).ok()?;
        let Some(first) = found.first() else {
            continue;
        };
        let message = match block.message {
            Some(ref msg) => selector::select_json(root, msg, false, engine)
                .ok()
                .and_then(SelectorOutcome::into_option),
            None => selector::json_scalar(first),
        };
        return Some(message.unwrap_or_else(|| format!("error selector matched: {}", sel)));
    }
    None
}

/// Where field selectors are evaluated
enum RowSource<'a> {
    Html(ElementRef<'a>),
    Json(&'a JsonValue),
}

impl RowSource<'_> {
    fn select(&self, block: &SelectorBlock, required: bool, engine: &TemplateEngine) -> Result<SelectorOutcome, SelectorError> {
        match self {
            RowSource::Html(el) => selector::select_html(*el, block, required, engine),
            RowSource::Json(v) => selector::select_json(v, block, required, engine),
        }
    }
}

pub struct ResponseParser<'a> {
    definition: &'a IndexerDefinition,
    categories: &'a CategoryMapper,
    site_link: &'a str,
}

impl<'a> ResponseParser<'a> {
    pub fn new(definition: &'a IndexerDefinition, categories: &'a CategoryMapper, site_link: &'a str) -> Self {
        Self {
            definition,
            categories,
            site_link,
        }
    }

    /// Parse a response body. Site-reported errors surface as [`IndexerError::Api`].
    pub fn parse(&self, body: &str, response: Option<&ResponseBlock>, engine: &TemplateEngine) -> IndexerResult<ParsedResponse> {
        let search = &self.definition.search;
        let ctx = engine.filter_context();
        let body = if search.preprocessingfilters.is_empty() {
            body.to_string()
        } else {
            apply_filters(&search.preprocessingfilters, body.to_string(), &ctx, |a| {
                engine.expand(a, false)
            })
        };

        if let Some(msg) = response.and_then(|r| r.no_results_message.as_deref()) {
            if !msg.is_empty() && body.contains(msg) {
                debug!("Site reported no results");
                return Ok(ParsedResponse::default());
            }
        }

        if response.is_some_and(|r| r.is_json()) {
            self.parse_json(&body, response, engine)
        } else {
            self.parse_html(&body, engine)
        }
    }

    fn parse_html(&self, body: &str, engine: &TemplateEngine) -> IndexerResult<ParsedResponse> {
        let document = Html::parse_document(body);
        let root = document.root_element();
        let search = &self.definition.search;

        if let Some(message) = find_html_error(root, &search.error, engine) {
            return Err(IndexerError::Api(message));
        }

        let rows_block = &search.rows;
        let rows = selector::select_all(root, &rows_block.selector)?;
        debug!(rows = rows.len(), "Matched result rows");

        let mut engine = engine.clone();
        let mut parsed = ParsedResponse::default();
        let step = rows_block.after + 1;
        let mut i = 0;
        while i < rows.len() {
            let row = rows[i];
            let following = &rows[(i + 1).min(rows.len())..(i + step).min(rows.len())];
            let date_header = rows_block
                .dateheaders
                .as_ref()
                .and_then(|block| self.date_header(row, block, &engine));

            let result = if rows_block.after > 0 || rows_block.remove.is_some() {
                let fragment = rebuild_row(row, following, rows_block)?;
                let wrapped = if row.value().name() == "tr" {
                    format!("<table><tbody>{}</tbody></table>", fragment)
                } else {
                    format!("<div>{}</div>", fragment)
                };
                let doc = Html::parse_fragment(&wrapped);
                let tag = row.value().name();
                match doc
                    .root_element()
                    .descendants()
                    .filter_map(ElementRef::wrap)
                    .find(|e| e.value().name() == tag)
                {
                    Some(el) => self.extract(RowSource::Html(el), date_header.as_deref(), &mut engine),
                    None => Err("row could not be rebuilt".to_string()),
                }
            } else {
                self.extract(RowSource::Html(row), date_header.as_deref(), &mut engine)
            };
            self.collect(result, i, &mut parsed);
            i += step;
        }
        Ok(parsed)
    }

    fn date_header(&self, row: ElementRef<'_>, block: &SelectorBlock, engine: &TemplateEngine) -> Option<String> {
        let sel = block.selector.as_deref()?;
        let css = selector::css(sel).ok()?;
        let header = row
            .prev_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| css.matches(el))?;
        let mut read = block.clone();
        read.selector = Some(String::new());
        selector::select_html(header, &read, false, engine)
            .ok()
            .and_then(SelectorOutcome::into_option)
    }

    fn parse_json(&self, body: &str, response: Option<&ResponseBlock>, engine: &TemplateEngine) -> IndexerResult<ParsedResponse> {
        let json: JsonValue =
            serde_json::from_str(body.trim()).map_err(|e| IndexerError::Parse(format!("invalid JSON: {}", e)))?;
        let search = &self.definition.search;

        if let Some(message) = find_json_error(&json, &search.error, engine) {
            return Err(IndexerError::Api(message));
        }

        let root = match response.and_then(|r| r.attribute.as_deref()) {
            Some(attr) => json.get(attr).cloned().unwrap_or(JsonValue::Null),
            None => json,
        };

        let rows_block = &search.rows;
        if let Some(ref count) = rows_block.count {
            let total = selector::select_json(&root, count, false, engine)?
                .into_option()
                .and_then(|v| parse_int(&v));
            if total == Some(0) {
                return Ok(ParsedResponse::default());
            }
        }

        let rows = selector::json_path(&root, &rows_block.selector)?;
        if rows.is_empty() {
            let present = !selector::select_json(&root, &SelectorBlock::css(rows_block.selector.clone()), false, engine)?
                .is_missing();
            if present || rows_block.missing_attribute_equals_no_results {
                return Ok(ParsedResponse::default());
            }
            return Err(IndexerError::Parse(format!(
                "rows selector '{}' did not match",
                rows_block.selector
            )));
        }

        let rows = expand_json_rows(rows, rows_block);
        let mut engine = engine.clone();
        let mut parsed = ParsedResponse::default();
        for (i, row) in rows.iter().enumerate() {
            let result = self.extract(RowSource::Json(row), None, &mut engine);
            self.collect(result, i, &mut parsed);
        }
        Ok(parsed)
    }

    fn collect(&self, result: Result<ReleaseInfo, String>, index: usize, parsed: &mut ParsedResponse) {
        match result {
            Ok(release) => parsed.releases.push(release),
            Err(reason) => {
                warn!(indexer_id = %self.definition.id, row = index, reason = %reason, "Skipping row");
                parsed.warnings.push(format!("row {}: {}", index, reason));
            }
        }
    }

    /// Evaluate every field for one row
    fn extract(&self, row: RowSource<'_>, date_header: Option<&str>, engine: &mut TemplateEngine) -> Result<ReleaseInfo, String> {
        engine.vars_mut().clear_query_prefix("Result.");
        let mut values: Vec<(String, String)> = Vec::new();

        for (key, block) in &self.definition.search.fields {
            let mut parts = key.split('|');
            let name = parts.next().unwrap_or_default().to_string();
            let append = parts.any(|m| m == "append");

            let outcome = row
                .select(block, !block.optional, engine)
                .map_err(|e| format!("field '{}': {}", name, e))?;
            let SelectorOutcome::Value(value) = outcome else {
                continue;
            };

            let value = match values.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) if append => {
                    slot.1.push_str(&value);
                    slot.1.clone()
                }
                Some(slot) => {
                    slot.1 = value.clone();
                    value
                }
                None => {
                    values.push((name.clone(), value.clone()));
                    value
                }
            };
            engine
                .vars_mut()
                .set_query(&format!("Result.{}", name), Value::Str(value));
        }

        self.build_release(&values, date_header, engine.filter_context().now)
    }

    /// Turn extracted field values into a release
    pub fn build_release(&self, values: &[(String, String)], date_header: Option<&str>, now: DateTime<Utc>) -> Result<ReleaseInfo, String> {
        let get = |name: &str| {
            values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.trim())
                .filter(|v| !v.is_empty())
        };
        let url = |value: &str| {
            resolve_url(self.site_link, value)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| value.to_string())
        };

        let title = get("title").ok_or("empty title")?.to_string();
        let details = get("details").or_else(|| get("comments")).map(url);

        let mut link = None;
        let mut magnet = get("magnet").map(str::to_string);
        if let Some(download) = get("download") {
            if download.starts_with("magnet:") {
                magnet.get_or_insert_with(|| download.to_string());
            } else {
                link = Some(url(download));
            }
        }
        if link.is_none() && magnet.is_none() {
            return Err("no download link or magnet".to_string());
        }

        let guid = get("guid")
            .map(str::to_string)
            .or_else(|| details.clone())
            .or_else(|| link.clone())
            .or_else(|| magnet.clone())
            .unwrap_or_else(|| title.clone());

        let publish_date = get("date")
            .or_else(|| get("publishdate"))
            .or(date_header)
            .and_then(|d| parse_fuzzy_date(d, now))
            .unwrap_or(now);

        let mut release = ReleaseInfo::for_protocol(self.definition.protocol, title, guid, publish_date);
        release.details = details;
        release.link = link;
        release.magnet_uri = magnet;
        release.size = get("size").and_then(parse_size);
        release.description = get("description").map(str::to_string);
        release.poster = get("poster").or_else(|| get("banner")).map(url);
        release.imdb = get("imdb").or_else(|| get("imdbid")).and_then(parse_id);
        release.tmdb = get("tmdbid").and_then(parse_id);
        release.tvdb_id = get("tvdbid").and_then(parse_id);
        release.year = get("year").and_then(parse_int);
        release.genres = get("genre")
            .map(|g| {
                g.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        for native in [get("category"), get("categorydesc")].into_iter().flatten() {
            for cat in self.categories.map_from_tracker(native) {
                if !release.categories.contains(&cat) {
                    release.categories.push(cat);
                }
            }
        }

        let grabs = get("grabs").and_then(parse_int);
        let files = get("files").and_then(parse_int);
        match release.protocol_info {
            ProtocolInfo::Torrent(ref mut t) => {
                t.seeders = get("seeders").and_then(parse_int);
                t.leechers = get("leechers").and_then(parse_int).or_else(|| {
                    let peers = get("peers").and_then(parse_int)?;
                    Some((peers - t.seeders.unwrap_or(0)).max(0))
                });
                t.grabs = grabs;
                t.files = files;
                t.info_hash = get("infohash").map(|h| h.to_lowercase());
                if let Some(f) = get("downloadvolumefactor").and_then(parse_float) {
                    t.download_volume_factor = f;
                }
                if let Some(f) = get("uploadvolumefactor").and_then(parse_float) {
                    t.upload_volume_factor = f;
                }
                t.minimum_ratio = get("minimumratio").and_then(parse_float);
                t.minimum_seed_time = get("minimumseedtime").and_then(|v| v.parse::<i64>().ok());
            }
            ProtocolInfo::Usenet(ref mut u) => {
                u.group = get("group").or_else(|| get("usenetgroup")).map(str::to_string);
                u.completion = get("completion").and_then(parse_float);
                u.password_protected = get("password")
                    .is_some_and(|p| Value::Str(p.to_string()).is_truthy());
                u.poster = get("author").map(str::to_string);
                u.grabs = grabs;
                u.files = files;
            }
            ProtocolInfo::Streaming(ref mut s) => {
                s.quality = get("quality").map(str::to_string);
                s.provider = get("provider").map(str::to_string);
            }
        }

        Ok(release)
    }
}

/// Serialize a row with its `after` rows merged in and `remove` subtrees dropped
fn rebuild_row(row: ElementRef<'_>, following: &[ElementRef<'_>], rows: &RowsBlock) -> IndexerResult<String> {
    let tag = row.value().name();
    let mut html = row.html();
    if !following.is_empty() {
        let close = format!("</{}>", tag);
        let merged: String = following.iter().map(|r| r.inner_html()).collect();
        match html.rfind(&close) {
            Some(pos) => html.insert_str(pos, &merged),
            None => html.push_str(&merged),
        }
    }
    if let Some(ref remove) = rows.remove {
        let candidates = std::iter::once(row).chain(following.iter().copied());
        for container in candidates {
            for hit in selector::select_all(container, remove)? {
                html = html.replacen(&hit.html(), "", 1);
            }
        }
    }
    Ok(html)
}

/// Flatten nested row arrays (`rows.attribute` + `multiple`), merging parent
/// keys into each child so fields can address both.
fn expand_json_rows(rows: Vec<JsonValue>, block: &RowsBlock) -> Vec<JsonValue> {
    let Some(ref attr) = block.attribute else {
        return rows;
    };
    let mut out = Vec::new();
    for row in rows {
        let children = match row.get(attr.as_str()) {
            Some(JsonValue::Array(items)) if block.multiple => items.clone(),
            Some(JsonValue::Array(items)) => items.first().cloned().into_iter().collect(),
            Some(child @ JsonValue::Object(_)) => vec![child.clone()],
            _ => Vec::new(),
        };
        for child in children {
            let mut merged = row.clone();
            if let (Some(target), JsonValue::Object(fields)) = (merged.as_object_mut(), child) {
                target.remove(attr.as_str());
                target.extend(fields);
            }
            out.push(merged);
        }
    }
    out
}
