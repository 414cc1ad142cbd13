//! Final score computation for a submitted sitting.

use std::collections::BTreeMap;

use crate::model::{AnswerValue, Question, QuestionId, QuestionKind};

/// Outcome of scoring a set of answers against a question set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreReport {
    pub earned_points: u64,
    pub total_points: u64,
    /// Normalized 0-100 score.
    pub score: u8,
    /// Essay questions that still need a manual grade.
    pub pending_manual: usize,
}

/// Score `answers` against `questions`.
///
/// Choice questions earn their weight only on an exact index match. Essay
/// questions count towards the total but never earn points here. Answers for
/// questions not in the set are ignored.
#[must_use]
pub fn score(questions: &[Question], answers: &BTreeMap<QuestionId, AnswerValue>) -> ScoreReport {
    let mut earned_points = 0_u64;
    let mut total_points = 0_u64;
    let mut pending_manual = 0_usize;

    for question in questions {
        let points = u64::from(question.points());
        total_points = total_points.saturating_add(points);

        match question.kind() {
            QuestionKind::Choice { correct_index, .. } => {
                let selected = answers.get(&question.id()).and_then(AnswerValue::choice_index);
                if selected == Some(*correct_index) {
                    earned_points = earned_points.saturating_add(points);
                }
            }
            QuestionKind::Essay => pending_manual += 1,
        }
    }

    ScoreReport {
        earned_points,
        total_points,
        score: normalize(earned_points, total_points),
        pending_manual,
    }
}

/// `round(earned / total * 100)`, half away from zero; zero when there is nothing to earn.
fn normalize(earned: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let earned = u128::from(earned.min(total));
    let total = u128::from(total);
    let rounded = (earned * 200 + total) / (total * 2);
    u8::try_from(rounded).unwrap_or(100)
}
