//! Cardigann - declarative indexer engine
//!
//! Command line front end: loads the definition catalog, builds the shared
//! HTTP/session context and runs a single command against it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cardigann::cli::{CliOptions, Command};
use cardigann::config::Config;
use cardigann::http::IndexerHttpClient;
use cardigann::indexer::definitions::{IndexerDefinition, validate};
use cardigann::indexer::{DefinitionCatalog, DownloadContent, IndexerContext, IndexerManager};
use cardigann::session::CookieStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cardigann=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let options = CliOptions::from_args()?;
    let config = Config::from_env()?;
    tracing::debug!(definitions = %config.definitions_path, "Configuration loaded");

    if let Command::Validate { ref files } = options.command {
        return validate_files(files);
    }

    let catalog = DefinitionCatalog::load_dir(&config.definitions_path)?;

    if let Command::List = options.command {
        for summary in catalog.list() {
            println!(
                "{:<24} {:<32} {:<13} {}",
                summary.id, summary.name, summary.tracker_type, summary.site_link
            );
        }
        return Ok(());
    }

    let ctx = build_context(&config).await?;
    let _sweeper = ctx.cookies.spawn_sweeper(config.cookie_sweep_interval);
    let manager = IndexerManager::new(catalog, ctx).with_cache_ttl(config.search_cache_ttl);

    let instance = options
        .instance_config()
        .context("This command needs a definition id")?;
    let indexer_id = instance.id.clone();
    manager.load_indexer(instance)?;

    match options.command {
        Command::Test => {
            manager.test_indexer(&indexer_id).await?;
            println!("{}: OK", indexer_id);
        }
        Command::Search { ref criteria } => {
            let results = manager.search_indexers(&[indexer_id], criteria).await;
            println!("{}", serde_json::to_string_pretty(&results)?);
            if let Some(error) = results.iter().find_map(|r| r.error.as_deref()) {
                bail!("{}", error);
            }
        }
        Command::Download { ref link, ref out } => {
            match manager.download(&indexer_id, link).await? {
                DownloadContent::Magnet { uri, .. } => println!("{}", uri),
                DownloadContent::Stream { url } => println!("{}", url),
                DownloadContent::Torrent { data, info_hash } => {
                    let path = out.clone().unwrap_or_else(|| format!("{}.torrent", info_hash).into());
                    std::fs::write(&path, data)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{} ({})", path.display(), info_hash);
                }
                DownloadContent::File { data, .. } => {
                    let path = out.clone().context("--out is required for file downloads")?;
                    std::fs::write(&path, data)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{}", path.display());
                }
            }
        }
        Command::List | Command::Validate { .. } => {}
    }

    Ok(())
}

async fn build_context(config: &Config) -> Result<IndexerContext> {
    let http = IndexerHttpClient::new(config.http_client_config())?;
    let http = attach_browser_pool(http, config).await;

    #[allow(unused_mut)]
    let mut ctx = IndexerContext::new(Arc::new(http))
        .with_rate_limit(config.default_rate_limit())
        .with_session_ttl(config.session_ttl);

    #[cfg(feature = "sqlite")]
    if let Some(ref url) = config.database_url {
        use cardigann::session::encryption::CookieCipher;
        use cardigann::session::sqlite::SqliteStore;

        let key = config.encryption_key.as_deref().with_context(|| {
            format!(
                "CARDIGANN_ENCRYPTION_KEY is required with a database, e.g. {}",
                CookieCipher::generate_key()
            )
        })?;
        let url = if url.starts_with("sqlite:") {
            url.clone()
        } else {
            format!("sqlite://{}", url)
        };
        let store = Arc::new(SqliteStore::connect(&url, CookieCipher::from_config_key(key)?).await?);
        tracing::info!("Session database connected");
        ctx = ctx
            .with_cookies(Arc::new(CookieStore::new(store.clone())))
            .with_health(store);
    }

    Ok(ctx)
}

#[cfg(feature = "chrome")]
async fn attach_browser_pool(http: IndexerHttpClient, config: &Config) -> IndexerHttpClient {
    use cardigann::browser::BrowserPool;
    use cardigann::browser::chrome::ChromeLauncher;

    if config.browser_pool_size == 0 {
        return http;
    }
    let pool = BrowserPool::new(Arc::new(ChromeLauncher::default()), config.browser_pool_config());
    let started = pool.start().await;
    if started < config.browser_pool_size {
        tracing::warn!(started, size = config.browser_pool_size, "Some browsers failed to start");
    }
    http.with_browser_pool(pool)
}

#[cfg(not(feature = "chrome"))]
async fn attach_browser_pool(http: IndexerHttpClient, _config: &Config) -> IndexerHttpClient {
    http
}

/// Expand directories into the definition files they contain
fn definition_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        if !path.is_dir() {
            files.push(path.clone());
            continue;
        }
        let mut found: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("yml") || e.eq_ignore_ascii_case("yaml"))
            })
            .collect();
        found.sort();
        files.extend(found);
    }
    Ok(files)
}

fn validate_files(paths: &[PathBuf]) -> Result<()> {
    let files = definition_files(paths)?;
    let mut failed = 0;
    for path in &files {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let issues = match serde_yaml::from_str::<IndexerDefinition>(&yaml) {
            Ok(def) => validate(&def).iter().map(ToString::to_string).collect(),
            Err(e) => vec![e.to_string()],
        };
        if issues.is_empty() {
            println!("{}: ok", path.display());
            continue;
        }
        failed += 1;
        for issue in issues {
            println!("{}: {}", path.display(), issue);
        }
    }
    if failed > 0 {
        bail!("{} of {} definitions are invalid", failed, files.len());
    }
    Ok(())
}
