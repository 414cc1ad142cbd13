use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{ExamId, ProgramId, QuestionId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExamError {
    #[error("exam title cannot be empty")]
    EmptyTitle,

    #[error("exam duration must be > 0 minutes")]
    InvalidDuration,

    #[error("passing grade must be between 0 and 100")]
    InvalidPassingGrade,

    #[error("question {0} appears more than once")]
    DuplicateQuestion(QuestionId),

    #[error("question {0} text cannot be empty")]
    EmptyQuestionText(QuestionId),

    #[error("choice question {0} needs at least two options")]
    TooFewOptions(QuestionId),

    #[error("choice question {id} has correct index {index} out of {len} options")]
    CorrectIndexOutOfRange { id: QuestionId, index: u32, len: usize },

    #[error("essay question {0} cannot carry options")]
    EssayWithOptions(QuestionId),

    #[error("table rows must all have {expected} cells, found {found}")]
    RaggedTable { expected: usize, found: usize },
}

//
// ─── QUESTIONS ─────────────────────────────────────────────────────────────────
//

/// Tabular material attached to a question (e.g. a spreadsheet excerpt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularPayload {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TabularPayload {
    /// # Errors
    ///
    /// Returns `ExamError::RaggedTable` if any row width differs from the header.
    pub fn new(header: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, ExamError> {
        let expected = header.len();
        if let Some(row) = rows.iter().find(|row| row.len() != expected) {
            return Err(ExamError::RaggedTable {
                expected,
                found: row.len(),
            });
        }
        Ok(Self { header, rows })
    }

    #[must_use]
    pub fn header(&self) -> &[String] {
        &self.header
    }

    #[must_use]
    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }
}

/// How a question is answered and graded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionKind {
    Choice { options: Vec<String>, correct_index: u32 },
    /// Free-form or practical answer, graded manually.
    Essay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    id: QuestionId,
    text: String,
    #[serde(flatten)]
    kind: QuestionKind,
    points: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table: Option<TabularPayload>,
}

impl Question {
    /// Create a multiple-choice question.
    ///
    /// # Errors
    ///
    /// Returns `ExamError` if the text is empty, fewer than two options are
    /// given, or `correct_index` does not point at an option.
    pub fn choice(
        id: QuestionId,
        text: impl Into<String>,
        options: Vec<String>,
        correct_index: u32,
        points: u32,
    ) -> Result<Self, ExamError> {
        Self {
            id,
            text: text.into(),
            kind: QuestionKind::Choice {
                options,
                correct_index,
            },
            points,
            table: None,
        }
        .validated()
    }

    /// Create a manually graded question.
    ///
    /// # Errors
    ///
    /// Returns `ExamError::EmptyQuestionText` if the text is blank.
    pub fn essay(id: QuestionId, text: impl Into<String>, points: u32) -> Result<Self, ExamError> {
        Self {
            id,
            text: text.into(),
            kind: QuestionKind::Essay,
            points,
            table: None,
        }
        .validated()
    }

    #[must_use]
    pub fn with_table(mut self, table: TabularPayload) -> Self {
        self.table = Some(table);
        self
    }

    /// Re-check invariants, e.g. after deserializing persisted content.
    ///
    /// # Errors
    ///
    /// Returns the first `ExamError` found.
    pub fn validated(self) -> Result<Self, ExamError> {
        if self.text.trim().is_empty() {
            return Err(ExamError::EmptyQuestionText(self.id));
        }
        if let QuestionKind::Choice {
            options,
            correct_index,
        } = &self.kind
        {
            if options.len() < 2 {
                return Err(ExamError::TooFewOptions(self.id));
            }
            let in_range = usize::try_from(*correct_index).is_ok_and(|idx| idx < options.len());
            if !in_range {
                return Err(ExamError::CorrectIndexOutOfRange {
                    id: self.id,
                    index: *correct_index,
                    len: options.len(),
                });
            }
        }
        Ok(self)
    }

    #[must_use]
    pub fn id(&self) -> QuestionId {
        self.id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn kind(&self) -> &QuestionKind {
        &self.kind
    }

    #[must_use]
    pub fn points(&self) -> u32 {
        self.points
    }

    #[must_use]
    pub fn table(&self) -> Option<&TabularPayload> {
        self.table.as_ref()
    }

    #[must_use]
    pub fn is_choice(&self) -> bool {
        matches!(self.kind, QuestionKind::Choice { .. })
    }

    /// Correct option index for choice questions.
    #[must_use]
    pub fn correct_index(&self) -> Option<u32> {
        match &self.kind {
            QuestionKind::Choice { correct_index, .. } => Some(*correct_index),
            QuestionKind::Essay => None,
        }
    }

    /// Number of options for choice questions, zero for essays.
    #[must_use]
    pub fn option_count(&self) -> usize {
        match &self.kind {
            QuestionKind::Choice { options, .. } => options.len(),
            QuestionKind::Essay => 0,
        }
    }
}

//
// ─── EXAM DEFINITION ───────────────────────────────────────────────────────────
//

/// Content and rules of one exam stage, as served by the content catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamDefinition {
    id: ExamId,
    program: ProgramId,
    title: String,
    duration_minutes: u32,
    passing_grade: u8,
    questions: Vec<Question>,
    active: bool,
}

impl ExamDefinition {
    /// Creates a new, active exam definition.
    ///
    /// # Errors
    ///
    /// Returns `ExamError` if the title is empty, the duration is zero, the
    /// passing grade exceeds 100, or question ids repeat.
    pub fn new(
        id: ExamId,
        program: ProgramId,
        title: impl Into<String>,
        duration_minutes: u32,
        passing_grade: u8,
        questions: Vec<Question>,
    ) -> Result<Self, ExamError> {
        Self {
            id,
            program,
            title: title.into().trim().to_string(),
            duration_minutes,
            passing_grade,
            questions,
            active: true,
        }
        .validated()
    }

    /// Re-check invariants, e.g. after deserializing persisted content.
    ///
    /// # Errors
    ///
    /// Returns the first `ExamError` found.
    pub fn validated(self) -> Result<Self, ExamError> {
        if self.title.trim().is_empty() {
            return Err(ExamError::EmptyTitle);
        }
        if self.duration_minutes == 0 {
            return Err(ExamError::InvalidDuration);
        }
        if self.passing_grade > 100 {
            return Err(ExamError::InvalidPassingGrade);
        }
        let mut seen = BTreeSet::new();
        let mut questions = Vec::with_capacity(self.questions.len());
        for question in self.questions {
            if !seen.insert(question.id()) {
                return Err(ExamError::DuplicateQuestion(question.id()));
            }
            questions.push(question.validated()?);
        }
        Ok(Self { questions, ..self })
    }

    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn id(&self) -> ExamId {
        self.id
    }

    #[must_use]
    pub fn program(&self) -> ProgramId {
        self.program
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    #[must_use]
    pub fn duration_minutes(&self) -> u32 {
        self.duration_minutes
    }

    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.duration_minutes))
    }

    #[must_use]
    pub fn passing_grade(&self) -> u8 {
        self.passing_grade
    }

    #[must_use]
    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn question(&self, id: QuestionId) -> Option<&Question> {
        self.questions.iter().find(|q| q.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<String> {
        vec!["A".into(), "B".into(), "C".into()]
    }

    #[test]
    fn choice_rejects_out_of_range_index() {
        let err = Question::choice(QuestionId::new(1), "Sum?", options(), 3, 10).unwrap_err();
        assert_eq!(
            err,
            ExamError::CorrectIndexOutOfRange {
                id: QuestionId::new(1),
                index: 3,
                len: 3
            }
        );
    }

    #[test]
    fn choice_requires_two_options() {
        let err =
            Question::choice(QuestionId::new(1), "Sum?", vec!["A".into()], 0, 10).unwrap_err();
        assert_eq!(err, ExamError::TooFewOptions(QuestionId::new(1)));
    }

    #[test]
    fn definition_rejects_duplicate_questions() {
        let q = Question::essay(QuestionId::new(5), "Describe", 20).unwrap();
        let err = ExamDefinition::new(
            ExamId::new(1),
            ProgramId::new(1),
            "Final",
            90,
            70,
            vec![q.clone(), q],
        )
        .unwrap_err();
        assert_eq!(err, ExamError::DuplicateQuestion(QuestionId::new(5)));
    }

    #[test]
    fn definition_rejects_zero_duration_and_bad_grade() {
        let err = ExamDefinition::new(ExamId::new(1), ProgramId::new(1), "Final", 0, 70, vec![])
            .unwrap_err();
        assert_eq!(err, ExamError::InvalidDuration);

        let err = ExamDefinition::new(ExamId::new(1), ProgramId::new(1), "Final", 10, 101, vec![])
            .unwrap_err();
        assert_eq!(err, ExamError::InvalidPassingGrade);
    }

    #[test]
    fn table_rows_must_match_header() {
        let err = TabularPayload::new(
            vec!["Name".into(), "Qty".into()],
            vec![vec!["Pen".into()]],
        )
        .unwrap_err();
        assert_eq!(err, ExamError::RaggedTable { expected: 2, found: 1 });
    }

    #[test]
    fn question_json_is_flat() {
        let q = Question::choice(QuestionId::new(2), "Pick", options(), 1, 5).unwrap();
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["kind"], "choice");
        assert_eq!(json["correct_index"], 1);
        let back: Question = serde_json::from_value(json).unwrap();
        assert_eq!(back, q);
    }
}
