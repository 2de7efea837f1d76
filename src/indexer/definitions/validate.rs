//! Structural validation of parsed definitions
//!
//! Every problem is collected rather than stopping at the first, so a
//! definition author sees the full list in one pass.

use std::collections::HashSet;
use std::fmt;

use super::model::IndexerDefinition;

/// One validation problem, addressed by a dotted field path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub const LOGIN_METHODS: &[&str] = &[
    "post", "form", "get", "oneurl", "cookie", "basic", "apikey", "none",
];

const TRACKER_TYPES: &[&str] = &["public", "semi-private", "private"];

/// Validate a definition, returning every issue found
pub fn validate(def: &IndexerDefinition) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if def.id.trim().is_empty() {
        issues.push(ValidationIssue::new("id", "must not be empty"));
    } else if def
        .id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
    {
        issues.push(ValidationIssue::new(
            "id",
            "may only contain letters, digits, '-', '_' and '.'",
        ));
    }

    if def.name.trim().is_empty() {
        issues.push(ValidationIssue::new("name", "must not be empty"));
    }

    if let Some(ref t) = def.tracker_type {
        if !TRACKER_TYPES.contains(&t.to_lowercase().as_str()) {
            issues.push(ValidationIssue::new(
                "type",
                format!("unknown tracker type '{}'", t),
            ));
        }
    }

    if def.links.is_empty() {
        issues.push(ValidationIssue::new("links", "at least one link is required"));
    }
    for (i, link) in def.links.iter().enumerate() {
        match url::Url::parse(link) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            _ => issues.push(ValidationIssue::new(
                format!("links[{}]", i),
                format!("'{}' is not an absolute http(s) URL", link),
            )),
        }
    }

    if let Some(ref encoding) = def.encoding {
        if encoding_rs::Encoding::for_label(encoding.as_bytes()).is_none() {
            issues.push(ValidationIssue::new(
                "encoding",
                format!("unknown encoding '{}'", encoding),
            ));
        }
    }

    if let Some(delay) = def.request_delay {
        if !(0.0..=3600.0).contains(&delay) {
            issues.push(ValidationIssue::new(
                "requestDelay",
                "must be between 0 and 3600 seconds",
            ));
        }
    }

    let mut seen = HashSet::new();
    for (i, setting) in def.settings.iter().enumerate() {
        if setting.name.trim().is_empty() {
            issues.push(ValidationIssue::new(
                format!("settings[{}].name", i),
                "must not be empty",
            ));
        } else if !seen.insert(setting.name.as_str()) {
            issues.push(ValidationIssue::new(
                format!("settings[{}].name", i),
                format!("duplicate setting '{}'", setting.name),
            ));
        }
    }

    if let Some(ref login) = def.login {
        let method = login.method.as_deref().unwrap_or("post").to_lowercase();
        if !LOGIN_METHODS.contains(&method.as_str()) {
            issues.push(ValidationIssue::new(
                "login.method",
                format!("unknown login method '{}'", method),
            ));
        }
        if matches!(method.as_str(), "post" | "form" | "get" | "oneurl")
            && login.path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            issues.push(ValidationIssue::new(
                "login.path",
                format!("required for login method '{}'", method),
            ));
        }
    }

    if let Some(ref caps) = def.caps {
        for (i, mapping) in caps.categorymappings.iter().enumerate() {
            if mapping.id.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("caps.categorymappings[{}].id", i),
                    "must not be empty",
                ));
            }
        }
    }

    if !def.uses_store_source() {
        let paths = def.search_paths();
        if paths.is_empty() {
            issues.push(ValidationIssue::new(
                "search.paths",
                "at least one search path is required",
            ));
        }
        for (i, path) in def.search.paths.iter().enumerate() {
            if path.path.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("search.paths[{}].path", i),
                    "must not be empty",
                ));
            }
        }
        if def.search.rows.selector.trim().is_empty() {
            issues.push(ValidationIssue::new("search.rows.selector", "must not be empty"));
        }
        if !def.search.fields.iter().any(|(name, _)| name == "title") {
            issues.push(ValidationIssue::new(
                "search.fields.title",
                "a title field is required",
            ));
        }
    }

    for (name, block) in &def.search.fields {
        if block.selector.is_none() && block.text.is_none() {
            issues.push(ValidationIssue::new(
                format!("search.fields.{}", name),
                "needs a selector or a text value",
            ));
        }
    }

    if let Some(ref download) = def.download {
        for (i, sel) in download.selectors.iter().enumerate() {
            if sel.selector.trim().is_empty() {
                issues.push(ValidationIssue::new(
                    format!("download.selectors[{}].selector", i),
                    "must not be empty",
                ));
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> IndexerDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_definition_has_no_issues() {
        let def = parse(
            r#"
id: ok
name: Ok
links: [https://ok.example/]
search:
  path: browse.php
  rows: {selector: tr}
  fields:
    title: {selector: a}
"#,
        );
        assert!(validate(&def).is_empty());
    }

    #[test]
    fn test_collects_all_issues() {
        let def = parse(
            r#"
id: "bad id"
name: ""
links: [not-a-url]
login:
  method: telepathy
settings:
  - {name: a}
  - {name: a}
search:
  rows: {selector: ""}
  fields:
    size: {}
"#,
        );
        let issues = validate(&def);
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"id"));
        assert!(paths.contains(&"name"));
        assert!(paths.contains(&"links[0]"));
        assert!(paths.contains(&"login.method"));
        assert!(paths.contains(&"settings[1].name"));
        assert!(paths.contains(&"search.paths"));
        assert!(paths.contains(&"search.rows.selector"));
        assert!(paths.contains(&"search.fields.title"));
        assert!(paths.contains(&"search.fields.size"));
    }

    #[test]
    fn test_issue_display() {
        let issue = ValidationIssue::new("links[0]", "bad");
        assert_eq!(issue.to_string(), "links[0]: bad");
    }
}
