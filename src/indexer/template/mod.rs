//! `{{ }}` template expansion
//!
//! Definitions use a Go-template-like syntax to build URLs, form inputs and
//! constant field values:
//!
//! ```text
//! {{ .Config.sitelink }}browse.php?q={{ .Keywords }}
//! {{ if .Query.IMDBID }}{{ .Query.IMDBID }}{{ else }}{{ .Keywords }}{{ end }}
//! {{ range .Categories }}&c{{ . }}=1{{ end }}
//! {{ .Keywords | re_replace "\\s+" "." | tolower }}
//! ```
//!
//! Templates are parsed into a small tree and evaluated with a hard step
//! ceiling, so a hostile or broken definition cannot hang a search.

mod eval;
mod parse;
mod value;

use chrono::{Datelike, Utc};
use encoding_rs::Encoding;

use eval::Escape;
pub use eval::MAX_TEMPLATE_STEPS;
pub use value::{TemplateVars, Value};

use super::filters::FilterContext;

/// Expands templates against a variable store
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    vars: TemplateVars,
    encoding: &'static Encoding,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(encoding_rs::UTF_8)
    }
}

impl TemplateEngine {
    pub fn new(encoding: &'static Encoding) -> Self {
        let mut vars = TemplateVars::new();
        let today = Utc::now();
        vars.set("Today.Year", today.year());
        vars.set("Today.Month", today.month() as i32);
        vars.set("Today.Day", today.day() as i32);
        Self { vars, encoding }
    }

    pub fn vars(&self) -> &TemplateVars {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut TemplateVars {
        &mut self.vars
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    pub fn filter_context(&self) -> FilterContext {
        FilterContext::with_encoding(self.encoding)
    }

    /// Expand a template.
    ///
    /// With `url_encode`, each value produced by an action is form-encoded in
    /// the definition's charset; literal text is left as written. A template
    /// that fails to parse is returned unchanged.
    pub fn expand(&self, template: &str, url_encode: bool) -> String {
        let escape = if url_encode { Escape::Form } else { Escape::None };
        self.expand_with(template, escape)
    }

    /// Expand a JSON document, escaping action values so they stay inside
    /// the string literals they are written into
    pub fn expand_json(&self, template: &str) -> String {
        self.expand_with(template, Escape::Json)
    }

    fn expand_with(&self, template: &str, escape: Escape) -> String {
        if !template.contains("{{") {
            return template.to_string();
        }
        let tree = match parse::parse(template) {
            Ok(tree) => tree,
            Err(e) => {
                tracing::warn!(template = %template, error = %e, "Template parse failed");
                return template.to_string();
            }
        };
        let mut evaluator = eval::Evaluator::new(&self.vars, self.filter_context(), escape);
        let mut out = String::with_capacity(template.len());
        evaluator.render(&tree, &mut out);
        out
    }

    /// Evaluate a template and report whether the result is truthy
    pub fn expand_truthy(&self, template: &str) -> bool {
        Value::Str(self.expand(template, false)).is_truthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> TemplateEngine {
        let mut e = TemplateEngine::default();
        let vars = e.vars_mut();
        vars.set("Config.sitelink", "https://site.example/");
        vars.set("Config.freeleech", true);
        vars.set("Config.sort", "time");
        vars.set_query("Keywords", "My Show S01E05");
        vars.set_query("Query.Season", 1);
        vars.set_query("Query.IMDBID", "");
        vars.set_query("Categories", Value::from(vec!["1", "7"]));
        e
    }

    #[test]
    fn test_no_braces_is_identity() {
        let e = engine();
        for s in ["", "plain text", "a { b } c", "100%"] {
            assert_eq!(e.expand(s, false), s);
            assert_eq!(e.expand(s, true), s);
        }
    }

    #[test]
    fn test_variables_and_url_encoding() {
        let e = engine();
        assert_eq!(
            e.expand("{{ .Config.sitelink }}search?q={{ .Keywords }}", false),
            "https://site.example/search?q=My Show S01E05"
        );
        assert_eq!(
            e.expand("q={{ .Keywords }}&x=a b", true),
            "q=My+Show+S01E05&x=a b"
        );
        assert_eq!(e.expand("{{ .Missing.Var }}", false), "");
    }

    #[test]
    fn test_conditionals() {
        let e = engine();
        assert_eq!(
            e.expand("{{ if .Config.freeleech }}free{{ else }}all{{ end }}", false),
            "free"
        );
        assert_eq!(
            e.expand("{{ if .Query.IMDBID }}imdb{{ else if .Keywords }}kw{{ else }}none{{ end }}", false),
            "kw"
        );
        assert_eq!(e.expand("{{ if .False }}x{{ end }}", false), "");
        assert_eq!(
            e.expand(r#"{{ if eq .Config.sort "time" }}t{{ end }}"#, false),
            "t"
        );
        assert_eq!(
            e.expand(r#"{{ if and .Config.freeleech (not .Query.IMDBID) }}y{{ end }}"#, false),
            "y"
        );
    }

    #[test]
    fn test_range_and_join() {
        let e = engine();
        assert_eq!(
            e.expand("{{ range .Categories }}&c{{ . }}=1{{ end }}", false),
            "&c1=1&c7=1"
        );
        assert_eq!(e.expand(r#"{{ join .Categories "," }}"#, false), "1,7");
        assert_eq!(e.expand("{{ range .Nothing }}x{{ else }}empty{{ end }}", false), "empty");
    }

    #[test]
    fn test_pipelines_into_filters_and_functions() {
        let e = engine();
        assert_eq!(
            e.expand(r#"{{ .Keywords | re_replace "\\s+" "." | tolower }}"#, false),
            "my.show.s01e05"
        );
        assert_eq!(
            e.expand(r#"{{ re_replace .Keywords "S\\d+E\\d+" "" }}"#, false),
            "My Show "
        );
        assert_eq!(e.expand(r#"{{ .Keywords | replace " " "_" }}"#, false), "My_Show_S01E05");
        assert_eq!(e.expand("{{ .Keywords | nosuchfilter }}", false), "My Show S01E05");
        assert_eq!(e.expand("{{ .Keywords | len }}", false), "14");
        assert_eq!(e.expand(r#"{{ printf "S%02d" .Query.Season }}"#, false), "S01");
    }

    #[test]
    fn test_today_and_booleans() {
        let e = engine();
        let year = Utc::now().year().to_string();
        assert_eq!(e.expand("{{ .Today.Year }}", false), year);
        assert_eq!(e.expand("{{ .True }}", false), "True");
    }

    #[test]
    fn test_malformed_template_returned_unchanged() {
        let e = engine();
        assert_eq!(e.expand("{{ if .Keywords }}x", false), "{{ if .Keywords }}x");
    }

    #[test]
    fn test_expand_json_escapes_values_only() {
        let mut e = TemplateEngine::default();
        e.vars_mut().set_query("Keywords", "a \"quoted\"\\path\nline");
        assert_eq!(
            e.expand_json(r#"{"q": "{{ .Keywords }}", "n": 1}"#),
            r#"{"q": "a \"quoted\"\\path\nline", "n": 1}"#
        );
        assert_eq!(e.expand_json(r#"{"q": "plain"}"#), r#"{"q": "plain"}"#);
    }

    #[test]
    fn test_step_ceiling_stops_runaway() {
        let mut e = TemplateEngine::default();
        let big: Vec<i64> = (0..1000).collect();
        e.vars_mut().set("Big", Value::from(big));
        let out = e.expand(
            "{{ range .Big }}{{ range .Big }}x{{ end }}{{ end }}",
            false,
        );
        assert!(out.len() < MAX_TEMPLATE_STEPS);
    }
}
