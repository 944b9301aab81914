//! Persistence gateway for chat history.
//!
//! The hub only needs two things from durable storage: append a message, and
//! read back the most recent messages of a channel. Anything implementing
//! [`MessageStore`] can back it; [`MemoryStore`] keeps a bounded log per
//! channel in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::trace;

/// Default number of history rows replayed on join.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default per-channel retention of [`MemoryStore`].
pub const DEFAULT_MEMORY_RETENTION: usize = 1_000;

/// Storage failures. Never fatal to a session.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The backend rejected or failed the operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backend is not reachable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// One persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Author display name.
    pub username: String,
    /// Message text.
    pub content: String,
    /// Ingress time.
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Create an entry.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            timestamp,
        }
    }
}

/// Durable message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Make sure a channel row exists. Called when a channel is first seen.
    async fn ensure_channel(&self, channel_id: &str, name: &str) -> Result<(), PersistError>;

    /// Append a message to a channel's log.
    async fn append(&self, channel_id: &str, entry: &HistoryEntry) -> Result<(), PersistError>;

    /// The last `limit` messages of a channel, most recent first.
    async fn recent_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PersistError>;
}

/// In-memory message log with a per-channel retention bound.
#[derive(Debug)]
pub struct MemoryStore {
    channels: DashMap<String, VecDeque<HistoryEntry>>,
    retention: usize,
}

impl MemoryStore {
    /// Create a store with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MEMORY_RETENTION)
    }

    /// Create a store keeping at most `retention` messages per channel.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            channels: DashMap::new(),
            retention: retention.max(1),
        }
    }

    /// Number of stored messages in a channel.
    #[must_use]
    pub fn message_count(&self, channel_id: &str) -> usize {
        self.channels.get(channel_id).map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn ensure_channel(&self, channel_id: &str, _name: &str) -> Result<(), PersistError> {
        self.channels.entry(channel_id.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, channel_id: &str, entry: &HistoryEntry) -> Result<(), PersistError> {
        let mut log = self.channels.entry(channel_id.to_string()).or_default();
        if log.len() == self.retention {
            log.pop_front();
        }
        log.push_back(entry.clone());
        trace!(channel = %channel_id, stored = log.len(), "Appended message");
        Ok(())
    }

    async fn recent_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, PersistError> {
        Ok(self
            .channels
            .get(channel_id)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_recent_history_is_most_recent_first() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        for i in 0..5 {
            let entry = HistoryEntry::new("alice", format!("m{i}"), t0 + Duration::seconds(i));
            store.append("general", &entry).await.unwrap();
        }

        let history = store.recent_history("general", 3).await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, ["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let store = MemoryStore::with_retention(2);
        for i in 0..3 {
            let entry = HistoryEntry::new("alice", format!("m{i}"), Utc::now());
            store.append("general", &entry).await.unwrap();
        }
        assert_eq!(store.message_count("general"), 2);

        let history = store.recent_history("general", 10).await.unwrap();
        assert_eq!(history.last().unwrap().content, "m1");
    }

    #[tokio::test]
    async fn test_unknown_channel_is_empty() {
        let store = MemoryStore::new();
        assert!(store.recent_history("nowhere", 50).await.unwrap().is_empty());

        store.ensure_channel("quiet", "Quiet").await.unwrap();
        assert!(store.recent_history("quiet", 50).await.unwrap().is_empty());
    }
}
