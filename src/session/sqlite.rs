//! SQLite-backed session and health store
//!
//! Cookie maps are serialized to JSON and sealed with [`CookieCipher`] before
//! they touch disk. Tables are created on connect.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row};

use super::encryption::CookieCipher;
use super::{CookieRecord, HealthStore, IndexerHealth, SessionStore};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS indexer_sessions (
        indexer_id TEXT PRIMARY KEY,
        sealed_cookies TEXT NOT NULL,
        cookie_expiry TEXT NOT NULL DEFAULT '{}',
        session_expiry TEXT,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS indexer_health (
        indexer_id TEXT PRIMARY KEY,
        last_success_at TEXT,
        last_error_at TEXT,
        last_error TEXT,
        error_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
];

#[derive(Debug, FromRow)]
struct SessionRow {
    sealed_cookies: String,
    cookie_expiry: String,
    session_expiry: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    cipher: CookieCipher,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url`, e.g. `sqlite://cardigann.db`
    pub async fn connect(url: &str, cipher: CookieCipher) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid SQLite URL: {}", url))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("Failed to open session database")?;
        Self::with_pool(pool, cipher).await
    }

    pub async fn with_pool(pool: SqlitePool, cipher: CookieCipher) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool, cipher })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load_cookies(&self, indexer_id: &str) -> Result<Option<CookieRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT sealed_cookies, cookie_expiry, session_expiry, updated_at
            FROM indexer_sessions
            WHERE indexer_id = ?
            "#,
        )
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let json = self
            .cipher
            .open(&row.sealed_cookies)
            .context("Failed to decrypt stored cookies")?;
        let cookies: HashMap<String, String> = serde_json::from_str(&json)?;
        let cookie_expiry: HashMap<String, DateTime<Utc>> =
            serde_json::from_str(&row.cookie_expiry).unwrap_or_default();

        Ok(Some(CookieRecord {
            cookies,
            cookie_expiry,
            session_expiry: row.session_expiry,
            updated_at: row.updated_at,
        }))
    }

    async fn save_cookies(&self, indexer_id: &str, record: &CookieRecord) -> Result<()> {
        let sealed = self.cipher.seal(&serde_json::to_string(&record.cookies)?)?;
        let expiry = serde_json::to_string(&record.cookie_expiry)?;

        sqlx::query(
            r#"
            INSERT INTO indexer_sessions (indexer_id, sealed_cookies, cookie_expiry, session_expiry, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (indexer_id) DO UPDATE SET
                sealed_cookies = excluded.sealed_cookies,
                cookie_expiry = excluded.cookie_expiry,
                session_expiry = excluded.session_expiry,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(indexer_id)
        .bind(sealed)
        .bind(expiry)
        .bind(record.session_expiry)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_cookies(&self, indexer_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM indexer_sessions WHERE indexer_id = ?")
            .bind(indexer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl HealthStore for SqliteStore {
    async fn load_health(&self, indexer_id: &str) -> Result<Option<IndexerHealth>> {
        let row = sqlx::query(
            r#"
            SELECT last_success_at, last_error_at, last_error, error_count
            FROM indexer_health
            WHERE indexer_id = ?
            "#,
        )
        .bind(indexer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| IndexerHealth {
            last_success_at: row.get("last_success_at"),
            last_error_at: row.get("last_error_at"),
            last_error: row.get("last_error"),
            error_count: row.get::<i64, _>("error_count").max(0) as u32,
        }))
    }

    async fn save_health(&self, indexer_id: &str, health: &IndexerHealth) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO indexer_health (indexer_id, last_success_at, last_error_at, last_error, error_count)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (indexer_id) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_error_at = excluded.last_error_at,
                last_error = excluded.last_error,
                error_count = excluded.error_count
            "#,
        )
        .bind(indexer_id)
        .bind(health.last_success_at)
        .bind(health.last_error_at)
        .bind(&health.last_error)
        .bind(health.error_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
        let cipher = CookieCipher::new(b"test key").unwrap();
        (SqliteStore::connect(&url, cipher).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_cookie_round_trip_is_encrypted() {
        let (store, _dir) = store().await;
        let mut record = CookieRecord::new(HashMap::from([("pass".into(), "hunter2".into())]));
        record
            .cookie_expiry
            .insert("pass".into(), Utc::now() + Duration::days(1));
        store.save_cookies("idx", &record).await.unwrap();

        let raw: String = sqlx::query_scalar("SELECT sealed_cookies FROM indexer_sessions")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(!raw.contains("hunter2"));

        let loaded = store.load_cookies("idx").await.unwrap().unwrap();
        assert_eq!(loaded.cookies, record.cookies);
        assert_eq!(loaded.cookie_expiry.len(), 1);

        store.clear_cookies("idx").await.unwrap();
        assert!(store.load_cookies("idx").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_health_upsert() {
        let (store, _dir) = store().await;
        let mut health = IndexerHealth::default();
        health.record_failure(Utc::now(), "HTTP 500");
        store.save_health("idx", &health).await.unwrap();
        health.record_failure(Utc::now(), "HTTP 502");
        store.save_health("idx", &health).await.unwrap();

        let loaded = store.load_health("idx").await.unwrap().unwrap();
        assert_eq!(loaded.error_count, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("HTTP 502"));
    }
}
