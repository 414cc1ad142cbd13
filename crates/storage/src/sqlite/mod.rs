use std::sync::Arc;
use std::time::Duration;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use thiserror::Error;

use crate::repository::{ContentCatalog, LocalCache, SessionStore, Storage};

mod cache_repo;
mod catalog_repo;
mod mapping;
mod migrate;
mod session_repo;
mod watch;

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
    poll_interval: Duration,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqliteInitError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl SqliteRepository {
    /// Connect to `SQLite` using the given URL.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if the connection cannot be established or if
    /// enforcing foreign key constraints fails during setup.
    pub async fn connect(database_url: &str) -> Result<Self, SqliteInitError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA journal_mode = WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA busy_timeout = 5000;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(Self {
            pool,
            poll_interval: Duration::from_millis(500),
        })
    }

    /// How often session watches poll for changes.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if migration queries fail.
    pub async fn migrate(&self) -> Result<(), SqliteInitError> {
        migrate::run_migrations(&self.pool).await
    }

    /// Create only the `local_cache` table, for a database that holds
    /// nothing but the device-local cache.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if migration queries fail.
    pub async fn migrate_cache(&self) -> Result<(), SqliteInitError> {
        migrate::run_cache_migrations(&self.pool).await
    }
}

impl Storage {
    /// Build a `Storage` backed by `SQLite`.
    ///
    /// Sessions and content live in `database_url`; the local cache gets its
    /// own database at `cache_url` so it can be wiped independently.
    ///
    /// # Errors
    ///
    /// Returns `SqliteInitError` if connection or migrations cannot be
    /// completed.
    pub async fn sqlite(
        database_url: &str,
        cache_url: &str,
        poll_interval: Duration,
    ) -> Result<Self, SqliteInitError> {
        let repo = SqliteRepository::connect(database_url)
            .await?
            .with_poll_interval(poll_interval);
        repo.migrate().await?;
        let cache_repo = SqliteRepository::connect(cache_url).await?;
        cache_repo.migrate_cache().await?;

        let sessions: Arc<dyn SessionStore> = Arc::new(repo.clone());
        let catalog: Arc<dyn ContentCatalog> = Arc::new(repo);
        let cache: Arc<dyn LocalCache> = Arc::new(cache_repo);
        Ok(Self {
            sessions,
            catalog,
            cache,
        })
    }
}
