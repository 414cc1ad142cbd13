//! Device-local mirror of the pieces of a sitting that must survive a reload.
//!
//! The cache is a convenience, never the source of truth: every failure is
//! logged and swallowed, and an administrator reset purges every entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use exam_core::model::{SessionId, TopicProgress};
use storage::repository::LocalCache;

/// Keys the engine writes per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntry {
    Deadline,
    CompletedTopics,
}

impl CacheEntry {
    pub const ALL: [CacheEntry; 2] = [CacheEntry::Deadline, CacheEntry::CompletedTopics];

    fn slug(self) -> &'static str {
        match self {
            CacheEntry::Deadline => "deadline",
            CacheEntry::CompletedTopics => "completed-topics",
        }
    }
}

#[derive(Clone)]
pub struct SittingCache {
    cache: Arc<dyn LocalCache>,
    session: SessionId,
}

impl SittingCache {
    #[must_use]
    pub fn new(cache: Arc<dyn LocalCache>, session: SessionId) -> Self {
        Self { cache, session }
    }

    #[must_use]
    pub fn key(&self, entry: CacheEntry) -> String {
        format!("exam-engine/{}/{}", self.session, entry.slug())
    }

    pub async fn store_deadline(&self, end_time: DateTime<Utc>) {
        self.put(CacheEntry::Deadline, &end_time.to_rfc3339()).await;
    }

    pub async fn load_deadline(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(CacheEntry::Deadline).await?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(err) => {
                tracing::warn!(session = %self.session, error = %err, "ignoring corrupt cached deadline");
                None
            }
        }
    }

    pub async fn store_completed(&self, completed: &TopicProgress) {
        match serde_json::to_string(completed) {
            Ok(raw) => self.put(CacheEntry::CompletedTopics, &raw).await,
            Err(err) => {
                tracing::warn!(session = %self.session, error = %err, "cannot encode completed topics");
            }
        }
    }

    pub async fn load_completed(&self) -> TopicProgress {
        let Some(raw) = self.get(CacheEntry::CompletedTopics).await else {
            return TopicProgress::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            tracing::warn!(session = %self.session, error = %err, "ignoring corrupt cached topics");
            TopicProgress::new()
        })
    }

    /// Remove every entry for this session. Returns how many removals failed.
    pub async fn purge(&self) -> usize {
        let mut failures = 0;
        for entry in CacheEntry::ALL {
            if let Err(err) = self.cache.remove_entry(&self.key(entry)).await {
                failures += 1;
                tracing::warn!(session = %self.session, key = entry.slug(), error = %err, "cache purge failed");
            }
        }
        failures
    }

    async fn get(&self, entry: CacheEntry) -> Option<String> {
        match self.cache.get_entry(&self.key(entry)).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(session = %self.session, key = entry.slug(), error = %err, "cache read failed");
                None
            }
        }
    }

    async fn put(&self, entry: CacheEntry, value: &str) {
        if let Err(err) = self.cache.put_entry(&self.key(entry), value).await {
            tracing::warn!(session = %self.session, key = entry.slug(), error = %err, "cache write failed");
        }
    }
}
