use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exam_core::model::{
    AnswerValue, ExamDefinition, ExamSession, ProgramId, QuestionId, SessionId, SessionStatus,
    Topic,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::feed::{SessionFeed, SessionSubscription, WatchEvent};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Connection(_))
    }
}

/// Authoritative store of exam session documents.
///
/// Every mutation is a partial write of a single field group, so concurrent
/// clients editing different questions never overwrite each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session document.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be reached.
    async fn get_session(&self, id: SessionId) -> Result<Option<ExamSession>, StorageError>;

    /// Create the session if no document exists yet and return the stored one.
    ///
    /// An existing document wins, so two clients racing to start the same
    /// sitting end up with a single deadline.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be reached.
    async fn create_session(&self, session: &ExamSession) -> Result<ExamSession, StorageError>;

    /// Set one answer field.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the document is gone and
    /// `StorageError::Conflict` if the session is already terminal.
    async fn set_answer(
        &self,
        id: SessionId,
        question: QuestionId,
        value: &AnswerValue,
    ) -> Result<(), StorageError>;

    /// Move the session into a terminal status. Returns `false` when the
    /// session already had that status (the stored score is kept).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the document is gone and
    /// `StorageError::Conflict` for backward or cross-terminal moves.
    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        final_score: Option<u8>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Administrator hard delete. Returns whether a document was removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the store cannot be reached.
    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError>;

    /// Watch a session document. The first event reflects the current state.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the watch cannot be established.
    async fn subscribe(&self, id: SessionId) -> Result<SessionSubscription, StorageError>;
}

/// Read side of exam content, keyed by program and topic.
#[async_trait]
pub trait ContentCatalog: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the catalog cannot be read.
    async fn exam_for(
        &self,
        program: ProgramId,
        topic: &Topic,
    ) -> Result<Option<ExamDefinition>, StorageError>;

    /// Persist or replace the definition for `(exam.program(), topic)`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the definition cannot be stored.
    async fn upsert_exam(&self, topic: &Topic, exam: &ExamDefinition) -> Result<(), StorageError>;

    /// Topics with content for a program, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the catalog cannot be read.
    async fn list_topics(&self, program: ProgramId) -> Result<Vec<Topic>, StorageError>;
}

/// Client-scoped key-value storage that survives reloads.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the cache cannot be read.
    async fn get_entry(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be written.
    async fn put_entry(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be removed.
    async fn remove_entry(&self, key: &str) -> Result<(), StorageError>;
}

/// Counters of effective session writes, for asserting exactly-once behavior.
#[derive(Debug, Default)]
pub struct WriteStats {
    answer_writes: AtomicU64,
    status_writes: AtomicU64,
}

impl WriteStats {
    #[must_use]
    pub fn answer_writes(&self) -> u64 {
        self.answer_writes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// Session writes can be made to fail with `fail_next_writes`, and the watch
/// channel can be interrupted with `drop_connection`.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    sessions: Arc<Mutex<HashMap<SessionId, ExamSession>>>,
    exams: Arc<Mutex<HashMap<(ProgramId, Topic), ExamDefinition>>>,
    cache: Arc<Mutex<HashMap<String, String>>>,
    feed: SessionFeed,
    pending_faults: Arc<AtomicU32>,
    stats: Arc<WriteStats>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` session writes fail with a connection error.
    pub fn fail_next_writes(&self, count: u32) {
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> &WriteStats {
        &self.stats
    }

    /// Signal a watch-channel outage to subscribers of `id`.
    pub fn drop_connection(&self, id: SessionId) {
        self.feed.publish(id, WatchEvent::ConnectionLost);
    }

    /// Re-deliver the current state of `id` to subscribers, as a watch channel
    /// does after reconnecting.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Connection` if the session map is poisoned.
    pub fn reconnect(&self, id: SessionId) -> Result<(), StorageError> {
        let event = current_event(self.lock_sessions()?.get(&id));
        self.feed.publish(id, event);
        Ok(())
    }

    fn take_fault(&self) -> Result<(), StorageError> {
        let injected = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Connection("injected write failure".into()));
        }
        Ok(())
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, ExamSession>>, StorageError> {
        self.sessions
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

fn current_event(session: Option<&ExamSession>) -> WatchEvent {
    match session {
        Some(session) => WatchEvent::Snapshot(session.clone()),
        None => WatchEvent::Missing,
    }
}

#[async_trait]
impl SessionStore for InMemoryRepository {
    async fn get_session(&self, id: SessionId) -> Result<Option<ExamSession>, StorageError> {
        Ok(self.lock_sessions()?.get(&id).cloned())
    }

    async fn create_session(&self, session: &ExamSession) -> Result<ExamSession, StorageError> {
        self.take_fault()?;
        let stored = {
            let mut guard = self.lock_sessions()?;
            guard
                .entry(session.id())
                .or_insert_with(|| session.clone())
                .clone()
        };
        self.feed
            .publish(stored.id(), WatchEvent::Snapshot(stored.clone()));
        Ok(stored)
    }

    async fn set_answer(
        &self,
        id: SessionId,
        question: QuestionId,
        value: &AnswerValue,
    ) -> Result<(), StorageError> {
        self.take_fault()?;
        let snapshot = {
            let mut guard = self.lock_sessions()?;
            let session = guard.get_mut(&id).ok_or(StorageError::NotFound)?;
            session
                .record_answer(question, value.clone())
                .map_err(|e| StorageError::Conflict(e.to_string()))?;
            session.clone()
        };
        self.stats.answer_writes.fetch_add(1, Ordering::SeqCst);
        self.feed.publish(id, WatchEvent::Snapshot(snapshot));
        Ok(())
    }

    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        final_score: Option<u8>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        self.take_fault()?;
        let (changed, snapshot) = {
            let mut guard = self.lock_sessions()?;
            let session = guard.get_mut(&id).ok_or(StorageError::NotFound)?;
            let changed = session
                .close(status, final_score, at)
                .map_err(|e| StorageError::Conflict(e.to_string()))?;
            (changed, session.clone())
        };
        if changed {
            self.stats.status_writes.fetch_add(1, Ordering::SeqCst);
            self.feed.publish(id, WatchEvent::Snapshot(snapshot));
        }
        Ok(changed)
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError> {
        let removed = self.lock_sessions()?.remove(&id).is_some();
        if removed {
            self.feed.publish(id, WatchEvent::Missing);
        }
        Ok(removed)
    }

    async fn subscribe(&self, id: SessionId) -> Result<SessionSubscription, StorageError> {
        let initial = current_event(self.lock_sessions()?.get(&id));
        Ok(self.feed.subscribe(id, initial))
    }
}

#[async_trait]
impl ContentCatalog for InMemoryRepository {
    async fn exam_for(
        &self,
        program: ProgramId,
        topic: &Topic,
    ) -> Result<Option<ExamDefinition>, StorageError> {
        let guard = self
            .exams
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(&(program, topic.clone())).cloned())
    }

    async fn upsert_exam(&self, topic: &Topic, exam: &ExamDefinition) -> Result<(), StorageError> {
        let mut guard = self
            .exams
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert((exam.program(), topic.clone()), exam.clone());
        Ok(())
    }

    async fn list_topics(&self, program: ProgramId) -> Result<Vec<Topic>, StorageError> {
        let guard = self
            .exams
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let mut topics: Vec<Topic> = guard
            .keys()
            .filter(|(p, _)| *p == program)
            .map(|(_, topic)| topic.clone())
            .collect();
        topics.sort();
        Ok(topics)
    }
}

#[async_trait]
impl LocalCache for InMemoryRepository {
    async fn get_entry(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self
            .cache
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(guard.get(key).cloned())
    }

    async fn put_entry(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut guard = self
            .cache
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_entry(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self
            .cache
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        guard.remove(key);
        Ok(())
    }
}

/// Aggregates the engine's stores behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub sessions: Arc<dyn SessionStore>,
    pub catalog: Arc<dyn ContentCatalog>,
    pub cache: Arc<dyn LocalCache>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_in_memory(&InMemoryRepository::new())
    }

    /// Share one in-memory repository across all three roles.
    #[must_use]
    pub fn from_in_memory(repo: &InMemoryRepository) -> Self {
        let sessions: Arc<dyn SessionStore> = Arc::new(repo.clone());
        let catalog: Arc<dyn ContentCatalog> = Arc::new(repo.clone());
        let cache: Arc<dyn LocalCache> = Arc::new(repo.clone());
        Self {
            sessions,
            catalog,
            cache,
        }
    }
}
