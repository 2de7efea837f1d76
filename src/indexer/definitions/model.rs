//! Cardigann YAML definition model
//!
//! A definition describes one site: where it lives, how to log in, how to
//! search, how to read the results and how to resolve a download link.
//!
//! ```yaml
//! id: example-tracker
//! name: Example Tracker
//! type: private
//! links:
//!   - https://example-tracker.com/
//! caps:
//!   categorymappings:
//!     - {id: 1, cat: Movies/HD, desc: "HD Movies"}
//!   modes:
//!     search: [q]
//!     tv-search: [q, season, ep]
//! login:
//!   path: login.php
//!   method: post
//!   inputs:
//!     username: "{{ .Config.username }}"
//! search:
//!   path: browse.php
//!   inputs:
//!     search: "{{ .Keywords }}"
//!   rows:
//!     selector: table.torrents > tbody > tr
//!   fields:
//!     title:
//!       selector: a.title
//! ```

use serde::Deserialize;

use super::de::{
    opt_scalar_string, ordered_map, ordered_string_map, scalar_string, string_list,
};
use super::settings::SettingsField;
use crate::indexer::types::Protocol;

/// Cardigann YAML indexer definition
#[derive(Debug, Clone, Deserialize)]
pub struct IndexerDefinition {
    pub id: String,
    #[serde(default, deserialize_with = "string_list")]
    pub replaces: Vec<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(rename = "type", default)]
    pub tracker_type: Option<String>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(rename = "requestDelay", default)]
    pub request_delay: Option<f64>,
    #[serde(default, deserialize_with = "string_list")]
    pub links: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub legacylinks: Vec<String>,
    #[serde(default)]
    pub followredirect: bool,
    #[serde(default)]
    pub testlinktorrent: Option<bool>,
    #[serde(default)]
    pub caps: Option<CapabilitiesBlock>,
    #[serde(default)]
    pub settings: Vec<SettingsField>,
    #[serde(default)]
    pub login: Option<LoginBlock>,
    pub search: SearchBlock,
    #[serde(default)]
    pub download: Option<DownloadBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilitiesBlock {
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub categories: Vec<(String, String)>,
    #[serde(default)]
    pub categorymappings: Vec<CategoryMappingDef>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub modes: Vec<(String, ModeParams)>,
    #[serde(default)]
    pub allowrawsearch: bool,
}

/// Parameters advertised for one search mode
#[derive(Debug, Clone, Default)]
pub struct ModeParams(pub Vec<String>);

impl<'de> Deserialize<'de> for ModeParams {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        string_list(deserializer).map(ModeParams)
    }
}

impl ModeParams {
    pub fn supports(&self, param: &str) -> bool {
        self.0.iter().any(|p| p.eq_ignore_ascii_case(param))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryMappingDef {
    #[serde(deserialize_with = "scalar_string")]
    pub id: String,
    #[serde(default)]
    pub cat: Option<String>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub submitpath: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub cookies: Vec<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub selectors: bool,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub inputs: Vec<(String, String)>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub selectorinputs: Vec<(String, SelectorBlock)>,
    #[serde(default, deserialize_with = "ordered_map")]
    pub getselectorinputs: Vec<(String, SelectorBlock)>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub error: Vec<ErrorBlock>,
    #[serde(default)]
    pub test: Option<TestBlock>,
    #[serde(default)]
    pub captcha: Option<CaptchaBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptchaBlock {
    #[serde(rename = "type", default)]
    pub captcha_type: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
}

/// An error marker: if `selector` matches, the page is an error page
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub message: Option<SelectorBlock>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub paths: Vec<SearchPath>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub headers: Vec<(String, String)>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub inputs: Vec<(String, String)>,
    #[serde(default)]
    pub keywordsfilters: Vec<FilterDef>,
    #[serde(default)]
    pub preprocessingfilters: Vec<FilterDef>,
    #[serde(default)]
    pub error: Vec<ErrorBlock>,
    #[serde(default)]
    pub rows: RowsBlock,
    #[serde(default, deserialize_with = "ordered_map")]
    pub fields: Vec<(String, SelectorBlock)>,
    /// Where results come from: `http` (default) or `store`
    #[serde(default)]
    pub source: Option<String>,
    /// Raw JSON body template for POST searches
    #[serde(default)]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPath {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub inputs: Vec<(String, String)>,
    #[serde(default = "default_true")]
    pub inheritinputs: bool,
    #[serde(default)]
    pub followredirect: Option<bool>,
    #[serde(default)]
    pub response: Option<ResponseBlock>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseBlock {
    #[serde(rename = "type", default)]
    pub response_type: Option<String>,
    #[serde(rename = "noResultsMessage", default)]
    pub no_results_message: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
}

impl ResponseBlock {
    pub fn is_json(&self) -> bool {
        self.response_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("json"))
    }

    pub fn is_xml(&self) -> bool {
        self.response_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("xml"))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowsBlock {
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub after: usize,
    #[serde(default)]
    pub remove: Option<String>,
    #[serde(default)]
    pub dateheaders: Option<SelectorBlock>,
    #[serde(default)]
    pub count: Option<SelectorBlock>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(rename = "missingAttributeEqualsNoResults", default)]
    pub missing_attribute_equals_no_results: bool,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
}

/// A declarative extraction instruction
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SelectorBlock {
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar_string")]
    pub text: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub remove: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, deserialize_with = "opt_scalar_string")]
    pub default: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
    #[serde(rename = "case", default, deserialize_with = "ordered_string_map")]
    pub case_map: Vec<(String, String)>,
}

impl SelectorBlock {
    /// Shorthand used by tests and programmatic construction
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Default::default()
        }
    }

    pub fn describe(&self) -> &str {
        self.selector
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or("<empty>")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDef {
    pub name: String,
    #[serde(default)]
    pub args: Option<serde_yaml::Value>,
}

impl FilterDef {
    pub fn new(name: impl Into<String>, args: Vec<&str>) -> Self {
        let args = match args.len() {
            0 => None,
            1 => Some(serde_yaml::Value::String(args[0].to_string())),
            _ => Some(serde_yaml::Value::Sequence(
                args.into_iter()
                    .map(|a| serde_yaml::Value::String(a.to_string()))
                    .collect(),
            )),
        };
        Self {
            name: name.into(),
            args,
        }
    }

    /// Arguments flattened to strings, in order
    pub fn arg_list(&self) -> Vec<String> {
        use super::de::yaml_to_string;
        match &self.args {
            None => Vec::new(),
            Some(serde_yaml::Value::Sequence(items)) => {
                items.iter().filter_map(yaml_to_string).collect()
            }
            Some(other) => yaml_to_string(other).into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadBlock {
    #[serde(default)]
    pub selectors: Vec<DownloadSelector>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub before: Option<BeforeBlock>,
    #[serde(default)]
    pub infohash: Option<InfohashBlock>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DownloadSelector {
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub usebeforeresponse: bool,
    #[serde(default)]
    pub filters: Vec<FilterDef>,
}

impl DownloadSelector {
    pub fn as_block(&self) -> SelectorBlock {
        SelectorBlock {
            selector: Some(self.selector.clone()),
            attribute: self.attribute.clone(),
            filters: self.filters.clone(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeforeBlock {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pathselector: Option<SelectorBlock>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub inputs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfohashBlock {
    pub hash: SelectorBlock,
    pub title: SelectorBlock,
    #[serde(default)]
    pub usebeforeresponse: bool,
}

impl IndexerDefinition {
    /// Every search path the definition declares, `path` first
    pub fn search_paths(&self) -> Vec<SearchPath> {
        let mut paths = Vec::new();
        if let Some(ref path) = self.search.path {
            paths.push(SearchPath {
                path: path.clone(),
                method: self.search.method.clone(),
                inheritinputs: true,
                ..Default::default()
            });
        }
        paths.extend(self.search.paths.iter().cloned());
        paths
    }

    /// Search modes advertised by the definition
    pub fn mode(&self, name: &str) -> Option<&ModeParams> {
        self.caps
            .as_ref()?
            .modes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn login_method(&self) -> Option<&str> {
        let login = self.login.as_ref()?;
        Some(login.method.as_deref().unwrap_or("post"))
    }

    /// Whether results come from an attached structured store instead of HTTP
    pub fn uses_store_source(&self) -> bool {
        self.search
            .source
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("store"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
id: example
name: Example
type: private
links:
  - https://example.org/
caps:
  categorymappings:
    - {id: 1, cat: Movies/HD, desc: "HD Movies"}
    - {id: 2, cat: TV, default: true}
  modes:
    search: [q]
    tv-search: [q, season, ep]
search:
  paths:
    - path: browse.php
      categories: [1]
  inputs:
    q: "{{ .Keywords }}"
    page: 1
  rows:
    selector: tr
  fields:
    title:
      selector: a
    download:
      selector: a.dl
      attribute: href
    size:
      selector: td.size
      filters:
        - name: replace
          args: [",", ""]
"#;

    #[test]
    fn test_parse_definition() {
        let def: IndexerDefinition = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(def.id, "example");
        assert_eq!(def.protocol, Protocol::Torrent);
        assert_eq!(def.search.inputs[1], ("page".to_string(), "1".to_string()));
        assert_eq!(def.search.fields[0].0, "title");
        assert_eq!(def.search.fields[2].1.filters[0].arg_list(), vec![",", ""]);
        assert_eq!(def.search_paths()[0].categories, vec!["1".to_string()]);
        assert!(def.mode("tv-search").unwrap().supports("season"));
        assert!(!def.mode("search").unwrap().supports("season"));
    }
}
