//! Indexer definitions
//!
//! Definitions are community-written YAML documents describing how to search,
//! log in to and download from a single site. They are parsed once, validated,
//! and shared immutably between every indexer instance that uses them.
//!
//! # Adding a new indexer
//!
//! 1. Write a YAML file describing the site (see [`model`] for the format)
//! 2. Drop it into the definitions directory
//! 3. Reference its `id` from an [`crate::indexer::IndexerInstanceConfig`]

pub mod de;
pub mod model;
pub mod settings;
pub mod validate;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

pub use model::{
    BeforeBlock, CapabilitiesBlock, CaptchaBlock, CategoryMappingDef, DownloadBlock,
    DownloadSelector, ErrorBlock, FilterDef, IndexerDefinition, InfohashBlock, LoginBlock,
    ModeParams, ResponseBlock, RowsBlock, SearchBlock, SearchPath, SelectorBlock, TestBlock,
};
pub use settings::{SettingKind, SettingsField};
pub use validate::{ValidationIssue, validate};

use super::error::{IndexerError, IndexerResult};

/// Parse and validate a single definition document
pub fn parse_definition(yaml: &str) -> IndexerResult<IndexerDefinition> {
    let def: IndexerDefinition =
        serde_yaml::from_str(yaml).map_err(|e| IndexerError::DefinitionParse(e.to_string()))?;
    let errors = validate(&def);
    if !errors.is_empty() {
        return Err(IndexerError::DefinitionValidation { errors });
    }
    Ok(def)
}

/// Summary of an available definition, for listing
#[derive(Debug, Clone)]
pub struct DefinitionSummary {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub tracker_type: String,
    pub language: String,
    pub site_link: String,
}

/// Definitions loaded from disk, keyed by id
///
/// Lookups also resolve ids listed under a definition's `replaces`.
#[derive(Debug, Default, Clone)]
pub struct DefinitionCatalog {
    definitions: HashMap<String, Arc<IndexerDefinition>>,
    aliases: HashMap<String, String>,
}

impl DefinitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.yml`/`.yaml` file in a directory.
    ///
    /// Files that fail to parse or validate are logged and skipped.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut catalog = Self::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read definitions directory {}", dir.display()))?;

        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
            })
            .collect();
        files.sort();

        for path in files {
            let yaml = match std::fs::read_to_string(&path) {
                Ok(y) => y,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read definition");
                    continue;
                }
            };
            match parse_definition(&yaml) {
                Ok(def) => {
                    tracing::debug!(definition_id = %def.id, path = %path.display(), "Loaded definition");
                    catalog.insert(def);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping invalid definition");
                }
            }
        }

        tracing::info!(count = catalog.len(), dir = %dir.display(), "Definition catalog loaded");
        Ok(catalog)
    }

    pub fn insert(&mut self, def: IndexerDefinition) {
        for old in &def.replaces {
            self.aliases.insert(old.clone(), def.id.clone());
        }
        self.definitions.insert(def.id.clone(), Arc::new(def));
    }

    pub fn get(&self, id: &str) -> Option<Arc<IndexerDefinition>> {
        self.definitions
            .get(id)
            .or_else(|| self.aliases.get(id).and_then(|to| self.definitions.get(to)))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// All definitions, sorted by name
    pub fn list(&self) -> Vec<DefinitionSummary> {
        let mut list: Vec<DefinitionSummary> = self
            .definitions
            .values()
            .map(|d| DefinitionSummary {
                id: d.id.clone(),
                name: d.name.clone(),
                description: d.description.clone(),
                tracker_type: d.tracker_type.clone().unwrap_or_else(|| "public".to_string()),
                language: d.language.clone().unwrap_or_else(|| "en-US".to_string()),
                site_link: d.links.first().cloned().unwrap_or_default(),
            })
            .collect();
        list.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEF: &str = r#"
id: newsite
replaces: [oldsite]
name: New Site
links: [https://new.example/]
search:
  path: search
  rows: {selector: tr}
  fields:
    title: {selector: a}
"#;

    #[test]
    fn test_parse_definition_reports_validation() {
        let err = parse_definition("id: x\nname: X\nsearch: {}\n").unwrap_err();
        assert!(matches!(err, IndexerError::DefinitionValidation { .. }));
        let err = parse_definition("id: [").unwrap_err();
        assert!(matches!(err, IndexerError::DefinitionParse(_)));
    }

    #[test]
    fn test_catalog_load_dir_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("new.yml"), DEF).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "id: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = DefinitionCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("newsite").unwrap().name, "New Site");
        assert_eq!(catalog.get("oldsite").unwrap().id, "newsite");
        assert_eq!(catalog.list()[0].site_link, "https://new.example/");
    }
}
