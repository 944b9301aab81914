//! Message store backends.
//!
//! The memory backend lives in huddle-core; this module adds the SQLite
//! backend and picks one from configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use huddle_core::{HistoryEntry, MemoryStore, MessageStore, PersistError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{StorageBackend, StorageConfig};

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT UNIQUE NOT NULL,
        password TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        content TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (channel_id) REFERENCES channels(id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (channel_id, id)",
];

const INSERT_CHANNEL: &str = "INSERT OR IGNORE INTO channels (id, name) VALUES (?, ?)";

/// Format SQLite's `CURRENT_TIMESTAMP` produces.
const SQLITE_DATETIME: &str = "%Y-%m-%d %H:%M:%S";

/// Open the configured message store.
///
/// # Errors
///
/// Returns an error if the SQLite database cannot be opened or migrated.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>> {
    match config.backend {
        StorageBackend::Memory => {
            info!(retention = config.memory_retention, "Using in-memory message store");
            Ok(Arc::new(MemoryStore::with_retention(config.memory_retention)))
        }
        StorageBackend::Sqlite => {
            let store = SqliteStore::connect(&config.database_url, config.max_connections).await?;
            info!(url = %config.database_url, "Using SQLite message store");
            Ok(Arc::new(store))
        }
    }
}

/// SQLite-backed message log.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if needed.
    ///
    /// In-memory databases get a single long-lived connection, since every
    /// SQLite connection would otherwise see its own empty database.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the database cannot be opened,
    /// or the schema cannot be created.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections.max(1));
        if url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {url}"))?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("Failed to create schema")?;
        }

        Ok(Self { pool })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn ensure_channel(&self, channel_id: &str, name: &str) -> Result<(), PersistError> {
        sqlx::query(INSERT_CHANNEL)
            .bind(channel_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    /// Appends in one transaction with the channel row, so a channel whose
    /// registration failed earlier still gets its messages stored.
    async fn append(&self, channel_id: &str, entry: &HistoryEntry) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        sqlx::query(INSERT_CHANNEL)
            .bind(channel_id)
            .bind(channel_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        sqlx::query(
            "INSERT INTO messages (username, content, channel_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.username)
        .bind(&entry.content)
        .bind(channel_id)
        .bind(entry.timestamp.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok(())
    }

    async fn recent_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PersistError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT username, content, CAST(created_at AS TEXT) AS created_at FROM messages
             WHERE channel_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(channel_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|row| {
                let username: String = row.try_get("username").map_err(storage_error)?;
                let content: String = row.try_get("content").map_err(storage_error)?;
                let created_at: String = row.try_get("created_at").map_err(storage_error)?;
                Ok(HistoryEntry::new(username, content, parse_timestamp(&created_at)))
            })
            .collect()
    }
}

fn storage_error(e: sqlx::Error) -> PersistError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            PersistError::Unavailable(e.to_string())
        }
        other => PersistError::Storage(other.to_string()),
    }
}

/// Parse a stored timestamp: RFC 3339, or SQLite's default datetime format.
/// Unparseable values fall back to now.
fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return t.with_timezone(&Utc);
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME) {
        return t.and_utc();
    }
    warn!(timestamp = %raw, "Unparseable message timestamp");
    Utc::now()
}
