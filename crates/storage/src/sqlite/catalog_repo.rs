use chrono::Utc;
use exam_core::model::{ExamDefinition, ProgramId, Topic};
use sqlx::Row;

use super::SqliteRepository;
use super::mapping::{conn, id_to_i64, ser};
use crate::repository::{ContentCatalog, StorageError};

#[async_trait::async_trait]
impl ContentCatalog for SqliteRepository {
    async fn exam_for(
        &self,
        program: ProgramId,
        topic: &Topic,
    ) -> Result<Option<ExamDefinition>, StorageError> {
        let row = sqlx::query(
            r"
                SELECT definition
                FROM exams
                WHERE program_id = ?1 AND topic = ?2
            ",
        )
        .bind(id_to_i64("program_id", program.value())?)
        .bind(topic.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(conn)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("definition").map_err(ser)?;
        let exam: ExamDefinition = serde_json::from_str(&raw).map_err(ser)?;
        exam.validated().map(Some).map_err(ser)
    }

    async fn upsert_exam(&self, topic: &Topic, exam: &ExamDefinition) -> Result<(), StorageError> {
        let definition = serde_json::to_string(exam).map_err(ser)?;
        sqlx::query(
            r"
                INSERT INTO exams (program_id, topic, exam_id, definition, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(program_id, topic) DO UPDATE SET
                    exam_id = excluded.exam_id,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at
            ",
        )
        .bind(id_to_i64("program_id", exam.program().value())?)
        .bind(topic.as_str())
        .bind(id_to_i64("exam_id", exam.id().value())?)
        .bind(definition)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(conn)?;
        Ok(())
    }

    async fn list_topics(&self, program: ProgramId) -> Result<Vec<Topic>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT topic
                FROM exams
                WHERE program_id = ?1
                ORDER BY topic
            ",
        )
        .bind(id_to_i64("program_id", program.value())?)
        .fetch_all(&self.pool)
        .await
        .map_err(conn)?;

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("topic").map_err(ser)?;
                Topic::new(raw).map_err(ser)
            })
            .collect()
    }
}
