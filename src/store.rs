//! Persistent key/value + tabular storage on a single SQLite file.
//!
//! One pool is shared by every component; each component owns its tables and
//! other components reach that data through the owning component, never by
//! querying the tables directly. The schema is created idempotently at open
//! (`CREATE TABLE IF NOT EXISTS`; evolution is additive columns only).
//!
//! Rows are read with typed column access and written with bound parameters,
//! so arbitrary content (separators, quotes, multi-byte text) survives
//! storage bit-for-bit.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

/// Storage errors surfaced to components.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

/// Handle to the shared SQLite database.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

/// Tables wiped by a factory reset, in deletion order.
pub const FACTORY_RESET_TABLES: &[&str] = &[
    "security_questions",
    "auth_tokens",
    "config",
    "rathole_config",
    "rathole_services",
    "ipv6_proxy_config",
    "ipv6_proxy_rules",
    "apn_config",
    "apn_templates",
    "sms",
    "sent_sms",
    "webhook_config",
    "sms_config",
];

impl Store {
    /// Open (or create) the database at the given path and initialize the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "database opened");
        Ok(store)
    }

    /// Open an in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Create every table this daemon uses. Safe to call repeatedly.
    async fn init_schema(&self) -> Result<(), StoreError> {
        const SCHEMA: &[&str] = &[
            "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS auth_tokens (
                token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS security_questions (
                id INTEGER PRIMARY KEY,
                question1 TEXT NOT NULL,
                question2 TEXT NOT NULL,
                answer1_hash TEXT NOT NULL,
                answer2_hash TEXT NOT NULL,
                iccid TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                locked INTEGER DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS sms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_read INTEGER DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS sent_sms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                status TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS sms_config (
                id INTEGER PRIMARY KEY,
                max_count INTEGER DEFAULT 50,
                max_sent_count INTEGER DEFAULT 10,
                sms_fix_enabled INTEGER DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS webhook_config (
                id INTEGER PRIMARY KEY,
                enabled INTEGER DEFAULT 0,
                platform TEXT DEFAULT 'pushplus',
                url TEXT DEFAULT '',
                body TEXT DEFAULT '',
                headers TEXT DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS apn_templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                apn TEXT NOT NULL,
                protocol TEXT DEFAULT 'dual',
                username TEXT DEFAULT '',
                password TEXT DEFAULT '',
                auth_method TEXT DEFAULT 'chap',
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS apn_config (
                id INTEGER PRIMARY KEY,
                mode INTEGER DEFAULT 0,
                template_id INTEGER DEFAULT 0,
                auto_start INTEGER DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS ipv6_proxy_config (
                id INTEGER PRIMARY KEY,
                enabled INTEGER DEFAULT 0,
                auto_start INTEGER DEFAULT 0,
                send_enabled INTEGER DEFAULT 0,
                send_interval INTEGER DEFAULT 60,
                webhook_url TEXT DEFAULT '',
                webhook_body TEXT DEFAULT '',
                webhook_headers TEXT DEFAULT ''
            )",
            "CREATE TABLE IF NOT EXISTS ipv6_proxy_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                local_port INTEGER NOT NULL,
                ipv6_port INTEGER NOT NULL,
                enabled INTEGER DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS rathole_config (
                id INTEGER PRIMARY KEY,
                server_addr TEXT DEFAULT '',
                auto_start INTEGER DEFAULT 0,
                enabled INTEGER DEFAULT 0
            )",
            "CREATE TABLE IF NOT EXISTS rathole_services (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL,
                local_addr TEXT NOT NULL,
                enabled INTEGER DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
        ];

        for sql in SCHEMA {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Read a string value from the `config` KV table.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Write a string value into the `config` KV table.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Read an integer from the KV table, falling back to `default` when the
    /// key is absent or unparsable.
    pub async fn config_get_i64(&self, key: &str, default: i64) -> Result<i64, StoreError> {
        Ok(self
            .config_get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default))
    }

    pub async fn config_set_i64(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.config_set(key, &value.to_string()).await
    }

    /// Wipe every table listed in [`FACTORY_RESET_TABLES`] and compact the
    /// file. Used by the factory-reset flow only.
    pub async fn factory_wipe(&self) -> Result<(), StoreError> {
        for table in FACTORY_RESET_TABLES {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn config_kv_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.config_get("missing").await.unwrap(), None);
        store.config_set("greeting", "hello").await.unwrap();
        assert_eq!(
            store.config_get("greeting").await.unwrap().as_deref(),
            Some("hello")
        );
        store.config_set("greeting", "bye").await.unwrap();
        assert_eq!(
            store.config_get("greeting").await.unwrap().as_deref(),
            Some("bye")
        );
    }

    #[tokio::test]
    async fn config_int_default_and_parse() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.config_get_i64("n", 7).await.unwrap(), 7);
        store.config_set_i64("n", 42).await.unwrap();
        assert_eq!(store.config_get_i64("n", 7).await.unwrap(), 42);
        store.config_set("n", "not-a-number").await.unwrap();
        assert_eq!(store.config_get_i64("n", 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn factory_wipe_clears_tables() {
        let store = Store::open_in_memory().await.unwrap();
        store.config_set("k", "v").await.unwrap();
        sqlx::query("INSERT INTO sms (sender, content, timestamp) VALUES ('+1', 'hi', 0)")
            .execute(store.pool())
            .await
            .unwrap();
        store.factory_wipe().await.unwrap();
        assert_eq!(store.config_get("k").await.unwrap(), None);
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sms")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
