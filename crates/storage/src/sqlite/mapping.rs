use std::collections::BTreeMap;

use exam_core::model::{
    AnswerValue, ExamId, ExamSession, QuestionId, SessionStatus, StudentId,
};
use sqlx::Row;

use crate::repository::StorageError;

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn conn<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

pub(crate) fn id_to_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

/// Split an answer into its `(kind, value)` columns.
pub(crate) fn answer_columns(value: &AnswerValue) -> (&'static str, String) {
    match value {
        AnswerValue::Choice(idx) => ("choice", idx.to_string()),
        AnswerValue::Reference(reference) => ("reference", reference.clone()),
    }
}

pub(crate) fn parse_answer(kind: &str, value: String) -> Result<AnswerValue, StorageError> {
    match kind {
        "choice" => value
            .parse::<u32>()
            .map(AnswerValue::Choice)
            .map_err(|_| StorageError::Serialization(format!("invalid choice index: {value}"))),
        "reference" => Ok(AnswerValue::Reference(value)),
        _ => Err(StorageError::Serialization(format!(
            "invalid answer kind: {kind}"
        ))),
    }
}

pub(crate) fn map_answer_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<(QuestionId, AnswerValue), StorageError> {
    let question = QuestionId::new(i64_to_u64(
        "question_id",
        row.try_get::<i64, _>("question_id").map_err(ser)?,
    )?);
    let kind: String = row.try_get("kind").map_err(ser)?;
    let value: String = row.try_get("value").map_err(ser)?;
    Ok((question, parse_answer(&kind, value)?))
}

pub(crate) fn map_session_row(
    row: &sqlx::sqlite::SqliteRow,
    answers: BTreeMap<QuestionId, AnswerValue>,
) -> Result<ExamSession, StorageError> {
    let exam_id = ExamId::new(i64_to_u64(
        "exam_id",
        row.try_get::<i64, _>("exam_id").map_err(ser)?,
    )?);
    let student_id = StudentId::new(i64_to_u64(
        "student_id",
        row.try_get::<i64, _>("student_id").map_err(ser)?,
    )?);
    let start_time = row.try_get("start_time").map_err(ser)?;
    let end_time = row.try_get("end_time").map_err(ser)?;
    let status_str: String = row.try_get("status").map_err(ser)?;
    let status = SessionStatus::parse(&status_str).map_err(ser)?;
    let final_score = row
        .try_get::<Option<i64>, _>("final_score")
        .map_err(ser)?
        .map(|score| {
            u8::try_from(score)
                .map_err(|_| StorageError::Serialization(format!("invalid final_score: {score}")))
        })
        .transpose()?;
    let submitted_at = row.try_get("submitted_at").map_err(ser)?;

    ExamSession::from_persisted(
        exam_id,
        student_id,
        start_time,
        end_time,
        answers,
        status,
        final_score,
        submitted_at,
    )
    .map_err(ser)
}
