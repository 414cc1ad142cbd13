use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{ExamId, QuestionId, SessionId, StudentId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionModelError {
    #[error("end_time is before start_time")]
    InvalidTimeRange,

    #[error("session is {0} and can no longer change")]
    Closed(SessionStatus),

    #[error("status cannot move from {from} to {to}")]
    InvalidStatusTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("final score must be between 0 and 100, got {0}")]
    InvalidScore(u8),

    #[error("invalid session status: {0}")]
    UnknownStatus(String),
}

//
// ─── STATUS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    InProgress,
    Submitted,
    Expired,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::InProgress)
    }

    /// Status only moves forward: `InProgress` into one terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        self == next || (self == SessionStatus::InProgress && next.is_terminal())
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Submitted => "SUBMITTED",
            SessionStatus::Expired => "EXPIRED",
        }
    }

    /// # Errors
    ///
    /// Returns `SessionModelError::UnknownStatus` for unrecognized values.
    pub fn parse(raw: &str) -> Result<Self, SessionModelError> {
        match raw {
            "IN_PROGRESS" => Ok(SessionStatus::InProgress),
            "SUBMITTED" => Ok(SessionStatus::Submitted),
            "EXPIRED" => Ok(SessionStatus::Expired),
            other => Err(SessionModelError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ─── ANSWERS ───────────────────────────────────────────────────────────────────
//

/// A recorded response to one question.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AnswerValue {
    /// Selected option index for a choice question.
    Choice(u32),
    /// Opaque reference, e.g. the URL of an uploaded artifact.
    Reference(String),
}

impl AnswerValue {
    #[must_use]
    pub fn choice_index(&self) -> Option<u32> {
        match self {
            AnswerValue::Choice(idx) => Some(*idx),
            AnswerValue::Reference(_) => None,
        }
    }
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Choice(idx) => write!(f, "option {idx}"),
            AnswerValue::Reference(reference) => f.write_str(reference),
        }
    }
}

//
// ─── SESSION ───────────────────────────────────────────────────────────────────
//

/// A student's sitting document in the authoritative session store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamSession {
    id: SessionId,
    exam_id: ExamId,
    student_id: StudentId,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    answers: BTreeMap<QuestionId, AnswerValue>,
    status: SessionStatus,
    final_score: Option<u8>,
    submitted_at: Option<DateTime<Utc>>,
}

impl ExamSession {
    /// Open a new session whose deadline is `start_time + duration`.
    #[must_use]
    pub fn start(
        exam_id: ExamId,
        student_id: StudentId,
        start_time: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            id: SessionId::for_sitting(exam_id, student_id),
            exam_id,
            student_id,
            start_time,
            end_time: start_time + duration.max(Duration::zero()),
            answers: BTreeMap::new(),
            status: SessionStatus::InProgress,
            final_score: None,
            submitted_at: None,
        }
    }

    /// Rehydrate a session from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionModelError` if the time range or score is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn from_persisted(
        exam_id: ExamId,
        student_id: StudentId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        answers: BTreeMap<QuestionId, AnswerValue>,
        status: SessionStatus,
        final_score: Option<u8>,
        submitted_at: Option<DateTime<Utc>>,
    ) -> Result<Self, SessionModelError> {
        if end_time < start_time {
            return Err(SessionModelError::InvalidTimeRange);
        }
        if let Some(score) = final_score.filter(|s| *s > 100) {
            return Err(SessionModelError::InvalidScore(score));
        }
        Ok(Self {
            id: SessionId::for_sitting(exam_id, student_id),
            exam_id,
            student_id,
            start_time,
            end_time,
            answers,
            status,
            final_score,
            submitted_at,
        })
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn exam_id(&self) -> ExamId {
        self.exam_id
    }

    #[must_use]
    pub fn student_id(&self) -> StudentId {
        self.student_id
    }

    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    #[must_use]
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    #[must_use]
    pub fn answers(&self) -> &BTreeMap<QuestionId, AnswerValue> {
        &self.answers
    }

    #[must_use]
    pub fn answer(&self, question: QuestionId) -> Option<&AnswerValue> {
        self.answers.get(&question)
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn final_score(&self) -> Option<u8> {
        self.final_score
    }

    #[must_use]
    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once the authoritative deadline has passed.
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time
    }

    /// Set a single answer while the session is open.
    ///
    /// # Errors
    ///
    /// Returns `SessionModelError::Closed` once the session is terminal.
    pub fn record_answer(
        &mut self,
        question: QuestionId,
        value: AnswerValue,
    ) -> Result<(), SessionModelError> {
        if self.is_terminal() {
            return Err(SessionModelError::Closed(self.status));
        }
        self.answers.insert(question, value);
        Ok(())
    }

    /// Move into a terminal status. Re-applying the same status is a no-op
    /// that keeps the first score.
    ///
    /// # Errors
    ///
    /// Returns `SessionModelError::InvalidStatusTransition` for backward or
    /// cross-terminal moves and `InvalidScore` for scores above 100.
    pub fn close(
        &mut self,
        status: SessionStatus,
        final_score: Option<u8>,
        at: DateTime<Utc>,
    ) -> Result<bool, SessionModelError> {
        if !self.status.can_transition_to(status) {
            return Err(SessionModelError::InvalidStatusTransition {
                from: self.status,
                to: status,
            });
        }
        if self.status == status {
            return Ok(false);
        }
        if let Some(score) = final_score.filter(|s| *s > 100) {
            return Err(SessionModelError::InvalidScore(score));
        }
        self.status = status;
        self.final_score = final_score;
        self.submitted_at = Some(at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;

    fn session() -> ExamSession {
        ExamSession::start(
            ExamId::new(1),
            StudentId::new(2),
            fixed_now(),
            Duration::minutes(180),
        )
    }

    #[test]
    fn deadline_is_start_plus_duration() {
        let s = session();
        assert_eq!(s.end_time(), fixed_now() + Duration::minutes(180));
        assert_eq!(s.id(), SessionId::for_sitting(ExamId::new(1), StudentId::new(2)));
        assert!(!s.is_past_deadline(fixed_now()));
        assert!(s.is_past_deadline(s.end_time()));
    }

    #[test]
    fn status_never_moves_backward() {
        let mut s = session();
        assert!(s.close(SessionStatus::Submitted, Some(80), fixed_now()).unwrap());
        assert!(!s.close(SessionStatus::Submitted, Some(10), fixed_now()).unwrap());
        assert_eq!(s.final_score(), Some(80));

        let err = s
            .close(SessionStatus::InProgress, None, fixed_now())
            .unwrap_err();
        assert!(matches!(err, SessionModelError::InvalidStatusTransition { .. }));
        let err = s.close(SessionStatus::Expired, None, fixed_now()).unwrap_err();
        assert!(matches!(err, SessionModelError::InvalidStatusTransition { .. }));
    }

    #[test]
    fn closed_session_rejects_answers() {
        let mut s = session();
        s.record_answer(QuestionId::new(1), AnswerValue::Choice(0))
            .unwrap();
        s.close(SessionStatus::Expired, None, fixed_now()).unwrap();
        let err = s
            .record_answer(QuestionId::new(2), AnswerValue::Choice(1))
            .unwrap_err();
        assert_eq!(err, SessionModelError::Closed(SessionStatus::Expired));
        assert_eq!(s.answers().len(), 1);
    }

    #[test]
    fn from_persisted_rejects_inverted_range() {
        let err = ExamSession::from_persisted(
            ExamId::new(1),
            StudentId::new(2),
            fixed_now(),
            fixed_now() - Duration::seconds(1),
            BTreeMap::new(),
            SessionStatus::InProgress,
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(err, SessionModelError::InvalidTimeRange);
    }

    #[test]
    fn status_parses_wire_names() {
        for status in [
            SessionStatus::InProgress,
            SessionStatus::Submitted,
            SessionStatus::Expired,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SessionStatus::parse("PAUSED").is_err());
    }
}
