use std::sync::Arc;

use exam_core::model::{AnswerValue, QuestionId, SessionId};
use storage::repository::SessionStore;

use crate::error::RecorderError;
use crate::retry::{RetryError, RetryPolicy, retry_transient};

/// Outcome of flushing a batch of pending answers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub flushed: Vec<QuestionId>,
    /// First failure; later answers in the batch were not attempted.
    pub error: Option<RecorderError>,
}

impl FlushReport {
    /// # Errors
    ///
    /// Returns the first recorder failure of the batch.
    pub fn into_result(self) -> Result<Vec<QuestionId>, RecorderError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.flushed),
        }
    }
}

/// Persists single answers as partial writes, retrying transient failures.
#[derive(Clone)]
pub struct AnswerRecorder {
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
}

impl AnswerRecorder {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Write one answer field of `session`.
    ///
    /// # Errors
    ///
    /// Returns `RecorderError::Fatal` once the retry budget is spent and
    /// `RecorderError::Rejected` for non-transient store errors.
    pub async fn record(
        &self,
        session: SessionId,
        question: QuestionId,
        value: &AnswerValue,
    ) -> Result<(), RecorderError> {
        let result = retry_transient(self.policy, "record answer", || {
            self.store.set_answer(session, question, value)
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(session = %session, question = %question, "answer recorded");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(RecorderError::Fatal {
                question,
                attempts,
                source: last,
            }),
            Err(RetryError::Permanent(source)) => {
                tracing::warn!(session = %session, question = %question, error = %source, "answer rejected");
                Err(RecorderError::Rejected { question, source })
            }
        }
    }

    /// Write `pending` answers in order, stopping at the first failure.
    pub async fn flush(
        &self,
        session: SessionId,
        pending: &[(QuestionId, AnswerValue)],
    ) -> FlushReport {
        let mut report = FlushReport::default();
        for (question, value) in pending {
            match self.record(session, *question, value).await {
                Ok(()) => report.flushed.push(*question),
                Err(err) => {
                    report.error = Some(err);
                    break;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use exam_core::model::{ExamId, ExamSession, StudentId};
    use exam_core::time::fixed_now;
    use std::time::Duration;
    use storage::repository::{InMemoryRepository, StorageError};

    async fn setup() -> (InMemoryRepository, AnswerRecorder, SessionId) {
        let repo = InMemoryRepository::new();
        let session = ExamSession::start(
            ExamId::new(1),
            StudentId::new(2),
            fixed_now(),
            ChronoDuration::minutes(60),
        );
        repo.create_session(&session).await.unwrap();
        let recorder = AnswerRecorder::new(
            Arc::new(repo.clone()),
            RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
        );
        (repo, recorder, session.id())
    }

    #[tokio::test]
    async fn retries_through_transient_faults() {
        let (repo, recorder, id) = setup().await;
        repo.fail_next_writes(2);

        recorder
            .record(id, QuestionId::new(1), &AnswerValue::Choice(2))
            .await
            .unwrap();

        let stored = repo.get_session(id).await.unwrap().unwrap();
        assert_eq!(stored.answer(QuestionId::new(1)), Some(&AnswerValue::Choice(2)));
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        let (repo, recorder, id) = setup().await;
        repo.fail_next_writes(3);

        let err = recorder
            .record(id, QuestionId::new(1), &AnswerValue::Choice(2))
            .await
            .unwrap_err();

        assert!(matches!(err, RecorderError::Fatal { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn deleted_session_is_rejected_without_retry() {
        let (repo, recorder, id) = setup().await;
        repo.delete_session(id).await.unwrap();

        let err = recorder
            .record(id, QuestionId::new(1), &AnswerValue::Choice(0))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RecorderError::Rejected {
                question: QuestionId::new(1),
                source: StorageError::NotFound,
            }
        );
    }

    #[tokio::test]
    async fn flush_stops_at_first_failure() {
        let (repo, recorder, id) = setup().await;
        let pending = vec![
            (QuestionId::new(1), AnswerValue::Choice(0)),
            (QuestionId::new(2), AnswerValue::Choice(1)),
        ];

        let report = recorder.flush(id, &pending[..1]).await;
        assert_eq!(report.flushed, vec![QuestionId::new(1)]);

        repo.fail_next_writes(3);
        let report = recorder.flush(id, &pending[1..]).await;
        assert!(report.flushed.is_empty());
        assert!(report.into_result().is_err());
    }
}
