//! Process-wide cache of compiled regular expressions
//!
//! Definition authors supply patterns at runtime, so every pattern is length
//! checked and compiled with a bounded program size. Rejected patterns are
//! remembered too, so a bad pattern is only reported once.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};

pub const MAX_PATTERN_LEN: usize = 1024;
const SIZE_LIMIT: usize = 1 << 20;
const MAX_ENTRIES: usize = 1024;

static CACHE: Lazy<RwLock<HashMap<String, Option<Arc<Regex>>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Compile (or fetch) a pattern. Returns `None` for rejected patterns.
pub fn compile(pattern: &str) -> Option<Arc<Regex>> {
    if let Some(entry) = CACHE.read().get(pattern) {
        return entry.clone();
    }

    let compiled = if pattern.len() > MAX_PATTERN_LEN {
        tracing::warn!(len = pattern.len(), "Regex pattern too long, ignoring");
        None
    } else {
        match RegexBuilder::new(pattern)
            .size_limit(SIZE_LIMIT)
            .dfa_size_limit(SIZE_LIMIT)
            .build()
        {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid regex pattern, ignoring");
                None
            }
        }
    };

    let mut cache = CACHE.write();
    if cache.len() >= MAX_ENTRIES {
        cache.clear();
    }
    cache.insert(pattern.to_string(), compiled.clone());
    compiled
}
