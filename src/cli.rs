//! Minimal CLI parsing for the `cardigann` binary.
//!
//! ```text
//! cardigann list
//! cardigann validate <dir|file.yml>...
//! cardigann test <definition> [--set key=value]...
//! cardigann search <definition> <query> [--type tv] [--season 1] [--episode 5]
//!                  [--imdb tt0944947] [--cat 5000] [--set key=value]...
//! cardigann download <definition> <link> [--out file] [--set key=value]...
//! ```

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};

use crate::indexer::{IndexerInstanceConfig, SearchCriteria, SearchType};

#[derive(Debug, Clone)]
pub enum Command {
    List,
    Validate { files: Vec<PathBuf> },
    Test,
    Search { criteria: SearchCriteria },
    Download { link: String, out: Option<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct CliOptions {
    pub command: Command,
    /// Definition the command runs against, when it needs one
    pub definition_id: Option<String>,
    pub settings: HashMap<String, String>,
    pub base_url: Option<String>,
}

impl CliOptions {
    pub fn from_args() -> Result<Self> {
        Self::parse(env::args().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut args = args.into_iter();
        let command = args.next().ok_or_else(|| anyhow!(usage()))?;

        let mut positional = Vec::new();
        let mut settings = HashMap::new();
        let mut base_url = None;
        let mut search_type = SearchType::Basic;
        let mut season = None;
        let mut episode = None;
        let mut imdb = None;
        let mut categories = Vec::new();
        let mut out = None;

        while let Some(arg) = args.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((f, v)) if f.starts_with("--") => (f.to_string(), Some(v.to_string())),
                _ => (arg.clone(), None),
            };
            let mut value = |name: &str| -> Result<String> {
                inline
                    .clone()
                    .or_else(|| args.next())
                    .ok_or_else(|| anyhow!("{} expects a value", name))
            };
            match flag.as_str() {
                "--set" => {
                    let pair = value("--set")?;
                    let (k, v) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow!("--set expects key=value, got '{}'", pair))?;
                    settings.insert(k.to_string(), v.to_string());
                }
                "--base-url" => base_url = Some(value("--base-url")?),
                "--type" => search_type = value("--type")?.parse()?,
                "--season" => {
                    season = Some(value("--season")?.parse().context("Invalid --season")?)
                }
                "--episode" => episode = Some(value("--episode")?),
                "--imdb" => imdb = Some(value("--imdb")?),
                "--cat" => {
                    for c in value("--cat")?.split(',') {
                        categories.push(c.trim().parse().context("Invalid --cat")?);
                    }
                }
                "--out" => out = Some(PathBuf::from(value("--out")?)),
                _ if arg.starts_with("--") => bail!("Unknown option {}", arg),
                _ => positional.push(arg),
            }
        }

        let mut positional = positional.into_iter();
        let (command, definition_id) = match command.as_str() {
            "list" => (Command::List, None),
            "validate" => {
                let files: Vec<PathBuf> = positional.by_ref().map(PathBuf::from).collect();
                if files.is_empty() {
                    bail!("validate expects a directory or definition files");
                }
                (Command::Validate { files }, None)
            }
            "test" => (Command::Test, Some(required(&mut positional, "definition")?)),
            "search" => {
                let definition = required(&mut positional, "definition")?;
                let query = positional.by_ref().collect::<Vec<_>>().join(" ");
                let mut criteria = SearchCriteria {
                    search_type,
                    query: Some(query).filter(|q| !q.is_empty()),
                    categories,
                    cache: false,
                    ..Default::default()
                };
                if let Some(season) = season {
                    criteria = criteria.with_season_episode(season, episode.as_deref());
                }
                if let Some(ref imdb) = imdb {
                    criteria = criteria.with_imdb(imdb);
                }
                (Command::Search { criteria }, Some(definition))
            }
            "download" => {
                let definition = required(&mut positional, "definition")?;
                let link = required(&mut positional, "link")?;
                (Command::Download { link, out }, Some(definition))
            }
            "help" | "--help" | "-h" => bail!(usage()),
            other => bail!("Unknown command '{}'\n{}", other, usage()),
        };

        Ok(Self {
            command,
            definition_id,
            settings,
            base_url,
        })
    }

    /// Instance configuration for the definition named on the command line
    pub fn instance_config(&self) -> Option<IndexerInstanceConfig> {
        let definition_id = self.definition_id.clone()?;
        Some(IndexerInstanceConfig {
            id: definition_id.clone(),
            name: definition_id.clone(),
            definition_id,
            enabled: true,
            settings: self.settings.clone(),
            base_url: self.base_url.clone(),
            priority: 0,
        })
    }
}

fn required(args: &mut impl Iterator<Item = String>, name: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("missing <{}>\n{}", name, usage()))
}

fn usage() -> &'static str {
    "usage: cardigann <list|validate|test|search|download> [args] [--set key=value]..."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliOptions> {
        CliOptions::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_search_command() {
        let opts = parse(&[
            "search", "mytracker", "My", "Show", "--type", "tv", "--season=1", "--episode", "5",
            "--set", "username=alice", "--cat", "5000,5040",
        ])
        .unwrap();

        assert_eq!(opts.definition_id.as_deref(), Some("mytracker"));
        assert_eq!(opts.settings.get("username").map(String::as_str), Some("alice"));
        let Command::Search { criteria } = opts.command else {
            panic!("expected search");
        };
        assert_eq!(criteria.search_type, SearchType::Tv);
        assert_eq!(criteria.query.as_deref(), Some("My Show"));
        assert_eq!(criteria.season, Some(1));
        assert_eq!(criteria.episode.as_deref(), Some("5"));
        assert_eq!(criteria.categories, vec![5000, 5040]);
    }

    #[test]
    fn test_instance_config() {
        let opts = parse(&["test", "mytracker", "--base-url", "https://mirror.example/"]).unwrap();
        let config = opts.instance_config().unwrap();
        assert_eq!(config.definition_id, "mytracker");
        assert_eq!(config.base_url.as_deref(), Some("https://mirror.example/"));
        assert!(config.enabled);

        assert!(parse(&["list"]).unwrap().instance_config().is_none());
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["validate"]).is_err());
        assert!(parse(&["search"]).is_err());
        assert!(parse(&["test", "x", "--set", "novalue"]).is_err());
        assert!(parse(&["test", "x", "--bogus"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
    }
}
