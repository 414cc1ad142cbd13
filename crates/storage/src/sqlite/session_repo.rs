use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use exam_core::model::{AnswerValue, ExamSession, QuestionId, SessionId, SessionStatus};
use sqlx::{Row, SqlitePool};

use super::SqliteRepository;
use super::mapping::{answer_columns, conn, id_to_i64, map_answer_row, map_session_row, ser};
use super::watch;
use crate::feed::SessionSubscription;
use crate::repository::{SessionStore, StorageError};

/// Load a session document together with its answers.
pub(crate) async fn load_session(
    pool: &SqlitePool,
    id: SessionId,
) -> Result<Option<ExamSession>, StorageError> {
    let key = id.to_string();
    let row = sqlx::query(
        r"
            SELECT exam_id, student_id, start_time, end_time, status, final_score, submitted_at
            FROM exam_sessions
            WHERE id = ?1
        ",
    )
    .bind(&key)
    .fetch_optional(pool)
    .await
    .map_err(conn)?;

    let Some(row) = row else {
        return Ok(None);
    };

    let answer_rows = sqlx::query(
        r"
            SELECT question_id, kind, value
            FROM session_answers
            WHERE session_id = ?1
        ",
    )
    .bind(&key)
    .fetch_all(pool)
    .await
    .map_err(conn)?;

    let answers = answer_rows
        .iter()
        .map(map_answer_row)
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    map_session_row(&row, answers).map(Some)
}

#[async_trait::async_trait]
impl SessionStore for SqliteRepository {
    async fn get_session(&self, id: SessionId) -> Result<Option<ExamSession>, StorageError> {
        load_session(&self.pool, id).await
    }

    async fn create_session(&self, session: &ExamSession) -> Result<ExamSession, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        let key = session.id().to_string();

        sqlx::query(
            r"
                INSERT INTO exam_sessions (
                    id, exam_id, student_id, start_time, end_time, status, revision
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
                ON CONFLICT(id) DO NOTHING
            ",
        )
        .bind(&key)
        .bind(id_to_i64("exam_id", session.exam_id().value())?)
        .bind(id_to_i64("student_id", session.student_id().value())?)
        .bind(session.start_time())
        .bind(session.end_time())
        .bind(session.status().as_str())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        for (question, value) in session.answers() {
            let (kind, raw) = answer_columns(value);
            sqlx::query(
                r"
                    INSERT INTO session_answers (session_id, question_id, kind, value, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(session_id, question_id) DO NOTHING
                ",
            )
            .bind(&key)
            .bind(id_to_i64("question_id", question.value())?)
            .bind(kind)
            .bind(raw)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(conn)?;
        }

        tx.commit().await.map_err(conn)?;

        load_session(&self.pool, session.id())
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn set_answer(
        &self,
        id: SessionId,
        question: QuestionId,
        value: &AnswerValue,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        let key = id.to_string();

        let status = current_status(&mut tx, &key).await?;
        if status.is_terminal() {
            return Err(StorageError::Conflict(format!(
                "session is {status} and can no longer change"
            )));
        }

        let (kind, raw) = answer_columns(value);
        sqlx::query(
            r"
                INSERT INTO session_answers (session_id, question_id, kind, value, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id, question_id) DO UPDATE SET
                    kind = excluded.kind,
                    value = excluded.value,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(&key)
        .bind(id_to_i64("question_id", question.value())?)
        .bind(kind)
        .bind(raw)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        bump_revision(&mut tx, &key).await?;
        tx.commit().await.map_err(conn)?;
        Ok(())
    }

    async fn set_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        final_score: Option<u8>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(conn)?;
        let key = id.to_string();

        let current = current_status(&mut tx, &key).await?;
        if !current.can_transition_to(status) {
            return Err(StorageError::Conflict(format!(
                "status cannot move from {current} to {status}"
            )));
        }
        if current == status {
            return Ok(false);
        }
        if let Some(score) = final_score.filter(|s| *s > 100) {
            return Err(StorageError::Conflict(format!("invalid final score {score}")));
        }

        let res = sqlx::query(
            r"
                UPDATE exam_sessions
                SET status = ?2, final_score = ?3, submitted_at = ?4
                WHERE id = ?1 AND status = 'IN_PROGRESS'
            ",
        )
        .bind(&key)
        .bind(status.as_str())
        .bind(final_score.map(i64::from))
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(conn)?;

        // Another writer closed the session first.
        if res.rows_affected() == 0 {
            tx.rollback().await.map_err(conn)?;
            return Ok(false);
        }

        bump_revision(&mut tx, &key).await?;
        tx.commit().await.map_err(conn)?;
        Ok(true)
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StorageError> {
        let res = sqlx::query("DELETE FROM exam_sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(conn)?;
        Ok(res.rows_affected() > 0)
    }

    async fn subscribe(&self, id: SessionId) -> Result<SessionSubscription, StorageError> {
        Ok(watch::spawn_poller(self.pool.clone(), id, self.poll_interval))
    }
}

async fn current_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
) -> Result<SessionStatus, StorageError> {
    let row = sqlx::query("SELECT status FROM exam_sessions WHERE id = ?1")
        .bind(key)
        .fetch_optional(&mut **tx)
        .await
        .map_err(conn)?
        .ok_or(StorageError::NotFound)?;
    let raw: String = row.try_get("status").map_err(ser)?;
    SessionStatus::parse(&raw).map_err(ser)
}

async fn bump_revision(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    key: &str,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE exam_sessions SET revision = revision + 1 WHERE id = ?1")
        .bind(key)
        .execute(&mut **tx)
        .await
        .map_err(conn)?;
    Ok(())
}
