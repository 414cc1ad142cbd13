//! Shared error types for the services crate.

use thiserror::Error;

use exam_core::model::{ExamError, QuestionId, SessionModelError, Topic, TopicSelection};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

use crate::retry::RetryError;
use crate::upload::UploadError;

/// Errors emitted by `AnswerRecorder`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RecorderError {
    /// Transient failures outlasted the retry budget. The answer is still held
    /// locally and will be flushed again.
    #[error("answer for question {question} not persisted after {attempts} attempts: {source}")]
    Fatal {
        question: QuestionId,
        attempts: u32,
        #[source]
        source: StorageError,
    },
    /// The store refused the write; retrying will not help.
    #[error("answer for question {question} rejected: {source}")]
    Rejected {
        question: QuestionId,
        #[source]
        source: StorageError,
    },
}

/// Errors emitted by `ExamSitting`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SittingError {
    #[error("no active exam content for {selection}")]
    ContentUnavailable { selection: TopicSelection },
    #[error("topic {0} is not part of this exam")]
    UnknownTopic(Topic),
    #[error("topic {0} is already completed")]
    TopicAlreadyCompleted(Topic),
    #[error("cannot {action} while {state}")]
    InvalidTransition { action: &'static str, state: String },
    #[error("{} topic(s) still open; acknowledge to submit anyway", .remaining.len())]
    ConfirmationRequired { remaining: Vec<Topic> },
    #[error("question index {index} out of range for {count} questions")]
    QuestionIndexOutOfRange { index: usize, count: usize },
    #[error("question {0} is not part of the open topic")]
    UnknownQuestion(QuestionId),
    #[error("answer does not fit question {0}")]
    AnswerMismatch(QuestionId),
    #[error("no exam session has been started")]
    NoActiveSession,
    #[error("exam session is already closed")]
    SessionClosed,
    #[error("operation superseded by an administrator reset")]
    Superseded,
    #[error("persistence failed after {attempts} attempts: {source}")]
    PersistenceFatal {
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("no artifact uploader is configured")]
    UploadUnavailable,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error(transparent)]
    Session(#[from] SessionModelError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SittingError {
    /// Whether the same call may succeed later without user intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            SittingError::PersistenceFatal { .. } => true,
            SittingError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<RecorderError> for SittingError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::Fatal {
                attempts, source, ..
            } => SittingError::PersistenceFatal { attempts, source },
            RecorderError::Rejected {
                source: StorageError::Conflict(_),
                ..
            } => SittingError::SessionClosed,
            RecorderError::Rejected { source, .. } => SittingError::Storage(source),
        }
    }
}

impl From<RetryError> for SittingError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => SittingError::PersistenceFatal {
                attempts,
                source: last,
            },
            RetryError::Permanent(source) => SittingError::Storage(source),
        }
    }
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
