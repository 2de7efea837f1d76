//! Declarative value extraction from HTML and JSON
//!
//! HTML selectors are CSS (via `scraper`) with two additions used throughout
//! community definitions: a leading `:root` that resolves against the whole
//! document, and `:contains("text")` which keeps elements whose text contains
//! the argument. JSON selectors are a small path language:
//! `$.data.items[0].name`, with optional `:has(key)`, `:not(key)` and
//! `:contains(value)` postfix filters.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use scraper::{ElementRef, Node, Selector};
use serde_json::Value as JsonValue;

use super::definitions::SelectorBlock;
use super::error::SelectorError;
use super::filters;
use super::template::TemplateEngine;

/// Result of evaluating a selector block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOutcome {
    Value(String),
    Missing,
}

impl SelectorOutcome {
    pub fn into_option(self) -> Option<String> {
        match self {
            SelectorOutcome::Value(v) => Some(v),
            SelectorOutcome::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, SelectorOutcome::Missing)
    }
}

const MAX_CACHED_SELECTORS: usize = 2048;

static SELECTORS: Lazy<RwLock<HashMap<String, Arc<Selector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Parse (or fetch) a CSS selector
pub fn css(selector: &str) -> Result<Arc<Selector>, SelectorError> {
    if let Some(s) = SELECTORS.read().get(selector) {
        return Ok(s.clone());
    }
    let parsed = Selector::parse(selector)
        .map(Arc::new)
        .map_err(|e| SelectorError::invalid(selector, format!("{:?}", e)))?;
    let mut cache = SELECTORS.write();
    if cache.len() >= MAX_CACHED_SELECTORS {
        cache.clear();
    }
    cache.insert(selector.to_string(), parsed.clone());
    Ok(parsed)
}

/// The topmost element of the document containing `el`
fn document_root(el: ElementRef<'_>) -> ElementRef<'_> {
    el.ancestors().filter_map(ElementRef::wrap).last().unwrap_or(el)
}

/// Every element matching `selector` beneath `container`
pub fn select_all<'a>(
    container: ElementRef<'a>,
    selector: &str,
) -> Result<Vec<ElementRef<'a>>, SelectorError> {
    let trimmed = selector.trim();
    if let Some(rest) = trimmed.strip_prefix(":root") {
        let root = document_root(container);
        let rest = rest.trim();
        if rest.is_empty() {
            return Ok(vec![root]);
        }
        let mut found = Vec::new();
        // The root element itself may match (":root html > body")
        if let Ok(sel) = css(rest) {
            if sel.matches(&root) {
                found.push(root);
            }
        }
        found.extend(select_all(root, rest)?);
        return Ok(found);
    }

    let Some(pos) = trimmed.find(":contains(") else {
        return Ok(container.select(&*css(trimmed)?).collect());
    };

    let head = trimmed[..pos].trim();
    let after = &trimmed[pos + ":contains(".len()..];
    let close = after
        .find(')')
        .ok_or_else(|| SelectorError::invalid(selector, "unterminated :contains("))?;
    let needle = after[..close].trim().trim_matches(|c| c == '"' || c == '\'');
    let rest = after[close + 1..].trim();

    let head = if head.is_empty() { "*" } else { head };
    let candidates: Vec<ElementRef<'a>> = container
        .select(&*css(head)?)
        .filter(|el| el.text().collect::<String>().contains(needle))
        .collect();

    if rest.is_empty() {
        return Ok(candidates);
    }
    // A combinator after :contains is applied as a descendant search
    let rest = rest.trim_start_matches(['>', '+', '~']).trim();
    let mut found = Vec::new();
    for el in candidates {
        for hit in select_all(el, rest)? {
            if !found.contains(&hit) {
                found.push(hit);
            }
        }
    }
    Ok(found)
}

/// Text of an element with the subtrees matching `remove` left out
pub fn element_text(el: ElementRef<'_>, remove: Option<&str>) -> Result<String, SelectorError> {
    let removed: Vec<_> = match remove {
        Some(r) if !r.trim().is_empty() => select_all(el, r)?.iter().map(|e| e.id()).collect(),
        _ => Vec::new(),
    };
    let mut out = String::new();
    for node in el.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        if !removed.is_empty()
            && node
                .ancestors()
                .take_while(|a| a.id() != el.id())
                .any(|a| removed.contains(&a.id()))
        {
            continue;
        }
        out.push_str(&text.text);
    }
    Ok(out.trim().to_string())
}

fn element_matches(el: ElementRef<'_>, selector: &str) -> bool {
    if selector == "*" {
        return true;
    }
    match css(selector) {
        Ok(sel) => sel.matches(&el) || el.select(&sel).next().is_some(),
        Err(_) => select_all(el, selector).map(|v| !v.is_empty()).unwrap_or(false),
    }
}

fn finish(
    block: &SelectorBlock,
    value: String,
    engine: &TemplateEngine,
) -> SelectorOutcome {
    let value = if value.is_empty() {
        match block.default {
            Some(ref d) => engine.expand(d, false),
            None => value,
        }
    } else {
        value
    };
    let ctx = engine.filter_context();
    let value = filters::apply_filters(&block.filters, value, &ctx, |a| engine.expand(a, false));
    SelectorOutcome::Value(value)
}

fn not_found(
    block: &SelectorBlock,
    required: bool,
    engine: &TemplateEngine,
) -> Result<SelectorOutcome, SelectorError> {
    if let Some(ref d) = block.default {
        return Ok(SelectorOutcome::Value(engine.expand(d, false)));
    }
    if required && !block.optional {
        return Err(SelectorError::no_match(block.describe()));
    }
    Ok(SelectorOutcome::Missing)
}

/// Evaluate a selector block against an HTML container
pub fn select_html(
    container: ElementRef<'_>,
    block: &SelectorBlock,
    required: bool,
    engine: &TemplateEngine,
) -> Result<SelectorOutcome, SelectorError> {
    if let Some(ref text) = block.text {
        return Ok(finish(block, engine.expand(text, false), engine));
    }
    let Some(ref selector) = block.selector else {
        return not_found(block, required, engine);
    };

    let selector = engine.expand(selector, false);
    let el = if selector.trim().is_empty() {
        Some(container)
    } else {
        select_all(container, &selector)?.into_iter().next()
    };
    let Some(el) = el else {
        return not_found(block, required, engine);
    };

    if !block.case_map.is_empty() {
        for (case_selector, replacement) in &block.case_map {
            if element_matches(el, case_selector) {
                return Ok(finish(block, engine.expand(replacement, false), engine));
            }
        }
        return not_found(block, required, engine);
    }

    let value = match block.attribute {
        Some(ref attr) => match el.value().attr(attr) {
            Some(v) => v.trim().to_string(),
            None => return not_found(block, required, engine),
        },
        None => element_text(el, block.remove.as_deref())?,
    };

    Ok(finish(block, value, engine))
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

#[derive(Debug, PartialEq)]
enum JsonFilter {
    Has(String),
    Not(String),
    Contains(String),
}

fn parse_json_path(path: &str) -> Result<(Vec<PathSegment>, Vec<JsonFilter>), SelectorError> {
    let path = path.trim();
    let (body, filter_src) = split_postfix(path);

    let mut segments = Vec::new();
    let mut key = String::new();
    let mut chars = body.trim_start_matches('$').chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !key.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut key)));
                }
            }
            '[' => {
                if !key.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut key)));
                }
                let mut idx = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    idx.push(d);
                }
                let idx = idx.trim().trim_matches(|c| c == '"' || c == '\'');
                match idx.parse::<usize>() {
                    Ok(i) => segments.push(PathSegment::Index(i)),
                    Err(_) => segments.push(PathSegment::Key(idx.to_string())),
                }
            }
            other => key.push(other),
        }
    }
    if !key.is_empty() {
        segments.push(PathSegment::Key(key));
    }

    let mut filters = Vec::new();
    let mut rest = filter_src;
    while !rest.is_empty() {
        let (name, arg, tail) = parse_pseudo(rest)
            .ok_or_else(|| SelectorError::invalid(path, "malformed JSON filter"))?;
        filters.push(match name {
            "has" => JsonFilter::Has(arg.to_string()),
            "not" => JsonFilter::Not(arg.trim_start_matches("has(").trim_end_matches(')').to_string()),
            "contains" => JsonFilter::Contains(arg.to_string()),
            other => {
                return Err(SelectorError::invalid(
                    path,
                    format!("unknown JSON filter ':{}'", other),
                ));
            }
        });
        rest = tail;
    }

    Ok((segments, filters))
}

/// Split `a.b:has(x)` into `a.b` and `:has(x)`
fn split_postfix(path: &str) -> (&str, &str) {
    let mut depth = 0;
    for (i, c) in path.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth -= 1,
            ':' if depth == 0 => return (&path[..i], &path[i..]),
            _ => {}
        }
    }
    (path, "")
}

/// Parse one `:name(arg)` returning (name, arg, remainder)
fn parse_pseudo(s: &str) -> Option<(&str, &str, &str)> {
    let s = s.trim().strip_prefix(':')?;
    let open = s.find('(')?;
    let name = &s[..open];
    let mut depth = 0;
    for (i, c) in s[open..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    let arg = s[open + 1..open + i].trim().trim_matches(|c| c == '"' || c == '\'');
                    return Some((name, arg, &s[open + i + 1..]));
                }
            }
            _ => {}
        }
    }
    None
}

fn json_has(v: &JsonValue, key: &str) -> bool {
    v.get(key).is_some_and(|x| !x.is_null())
}

fn json_contains(v: &JsonValue, needle: &str) -> bool {
    json_scalar(v).is_some_and(|s| s.contains(needle))
}

fn passes(v: &JsonValue, filters: &[JsonFilter]) -> bool {
    filters.iter().all(|f| match f {
        JsonFilter::Has(k) => json_has(v, k),
        JsonFilter::Not(k) => !json_has(v, k),
        JsonFilter::Contains(n) => json_contains(v, n),
    })
}

/// Resolve a JSON path. Postfix filters are applied to array items, or to
/// the resolved value itself when it is not an array.
pub fn json_path(value: &JsonValue, path: &str) -> Result<Vec<JsonValue>, SelectorError> {
    let (segments, filters) = parse_json_path(path)?;
    let mut current = value;
    for seg in &segments {
        let next = match seg {
            PathSegment::Key(k) => current.get(k.as_str()),
            PathSegment::Index(i) => current.get(*i),
        };
        match next {
            Some(n) => current = n,
            None => return Ok(Vec::new()),
        }
    }

    match current {
        JsonValue::Array(items) => Ok(items
            .iter()
            .filter(|item| passes(item, &filters))
            .cloned()
            .collect()),
        JsonValue::Null => Ok(Vec::new()),
        other if passes(other, &filters) => Ok(vec![other.clone()]),
        _ => Ok(Vec::new()),
    }
}

/// Resolve a path to a single node, keeping arrays intact
fn json_lookup(value: &JsonValue, path: &str) -> Result<Option<JsonValue>, SelectorError> {
    let (segments, filters) = parse_json_path(path)?;
    let mut current = value;
    for seg in &segments {
        let next = match seg {
            PathSegment::Key(k) => current.get(k.as_str()),
            PathSegment::Index(i) => current.get(*i),
        };
        match next {
            Some(n) => current = n,
            None => return Ok(None),
        }
    }
    if current.is_null() {
        return Ok(None);
    }
    if filters.is_empty() {
        return Ok(Some(current.clone()));
    }
    Ok(match current {
        JsonValue::Array(items) => {
            let kept: Vec<JsonValue> = items.iter().filter(|i| passes(i, &filters)).cloned().collect();
            (!kept.is_empty()).then_some(JsonValue::Array(kept))
        }
        other => passes(other, &filters).then(|| other.clone()),
    })
}

/// Scalar rendering. Arrays of scalars join with `,`
pub fn json_scalar(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Array(items) => Some(
            items
                .iter()
                .filter_map(json_scalar)
                .collect::<Vec<_>>()
                .join(","),
        ),
        JsonValue::Object(_) => Some(v.to_string()),
    }
}

/// Evaluate a selector block against a JSON value
pub fn select_json(
    value: &JsonValue,
    block: &SelectorBlock,
    required: bool,
    engine: &TemplateEngine,
) -> Result<SelectorOutcome, SelectorError> {
    if let Some(ref text) = block.text {
        return Ok(finish(block, engine.expand(text, false), engine));
    }
    let Some(ref selector) = block.selector else {
        return not_found(block, required, engine);
    };
    let selector = engine.expand(selector, false);

    let Some(found) = json_lookup(value, &selector)? else {
        return not_found(block, required, engine);
    };
    let Some(text) = json_scalar(&found) else {
        return not_found(block, required, engine);
    };

    if !block.case_map.is_empty() {
        for (key, replacement) in &block.case_map {
            if key == "*" || key == &text {
                return Ok(finish(block, engine.expand(replacement, false), engine));
            }
        }
        return not_found(block, required, engine);
    }

    Ok(finish(block, text.trim().to_string(), engine))
}
