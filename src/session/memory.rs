//! Process-local store, used by the CLI and tests

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CookieRecord, HealthStore, IndexerHealth, SessionStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    cookies: RwLock<HashMap<String, CookieRecord>>,
    health: RwLock<HashMap<String, IndexerHealth>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load_cookies(&self, indexer_id: &str) -> Result<Option<CookieRecord>> {
        Ok(self.cookies.read().get(indexer_id).cloned())
    }

    async fn save_cookies(&self, indexer_id: &str, record: &CookieRecord) -> Result<()> {
        self.cookies
            .write()
            .insert(indexer_id.to_string(), record.clone());
        Ok(())
    }

    async fn clear_cookies(&self, indexer_id: &str) -> Result<()> {
        self.cookies.write().remove(indexer_id);
        Ok(())
    }
}

#[async_trait]
impl HealthStore for MemoryStore {
    async fn load_health(&self, indexer_id: &str) -> Result<Option<IndexerHealth>> {
        Ok(self.health.read().get(indexer_id).cloned())
    }

    async fn save_health(&self, indexer_id: &str, health: &IndexerHealth) -> Result<()> {
        self.health
            .write()
            .insert(indexer_id.to_string(), health.clone());
        Ok(())
    }
}
