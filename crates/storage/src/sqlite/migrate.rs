use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the full schema (exam content, session documents, per-question
/// answers, local cache entries, and indexes).
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS exams (
                    program_id INTEGER NOT NULL,
                    topic TEXT NOT NULL,
                    exam_id INTEGER NOT NULL,
                    definition TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (program_id, topic)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS exam_sessions (
                    id TEXT PRIMARY KEY,
                    exam_id INTEGER NOT NULL,
                    student_id INTEGER NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('IN_PROGRESS', 'SUBMITTED', 'EXPIRED')),
                    final_score INTEGER CHECK (final_score BETWEEN 0 AND 100),
                    submitted_at TEXT,
                    revision INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (exam_id, student_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS session_answers (
                    session_id TEXT NOT NULL,
                    question_id INTEGER NOT NULL,
                    kind TEXT NOT NULL CHECK (kind IN ('choice', 'reference')),
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (session_id, question_id),
                    FOREIGN KEY (session_id) REFERENCES exam_sessions(id) ON DELETE CASCADE
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        create_local_cache(&mut tx).await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_exam_sessions_student
                    ON exam_sessions (student_id, status);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}

/// Schema for a cache-only database. Versions are tracked in
/// `cache_migrations` so the cache may share a file with the main schema.
pub async fn run_cache_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS cache_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    let applied = sqlx::query("SELECT 1 FROM cache_migrations WHERE version = 1")
        .fetch_optional(pool)
        .await?
        .is_some();
    if applied {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    create_local_cache(&mut tx).await?;
    sqlx::query(
        r"
            INSERT INTO cache_migrations (version, applied_at)
            VALUES (1, ?1)
            ON CONFLICT(version) DO NOTHING
        ",
    )
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn create_local_cache(tx: &mut Transaction<'_, Sqlite>) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS local_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        ",
    )
    .execute(&mut **tx)
    .await?;
    Ok(())
}
