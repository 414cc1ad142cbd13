use std::sync::Arc;

use exam_core::model::{EngineSettings, ProgramId, Topic};
use storage::repository::{ContentCatalog, SessionStore, Storage};

use crate::Clock;
use crate::error::AppServicesError;
use crate::sittings::{ExamSitting, SittingKey};
use crate::upload::ArtifactUploader;

/// Assembles storage, settings and clock, and hands out sittings.
#[derive(Clone)]
pub struct AppServices {
    storage: Storage,
    settings: EngineSettings,
    clock: Clock,
    uploader: Option<Arc<dyn ArtifactUploader>>,
}

impl AppServices {
    #[must_use]
    pub fn new(storage: Storage, settings: EngineSettings, clock: Clock) -> Self {
        Self {
            storage,
            settings,
            clock,
            uploader: None,
        }
    }

    /// Build services backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if storage initialization fails.
    pub async fn new_sqlite(
        db_url: &str,
        cache_url: &str,
        settings: EngineSettings,
        clock: Clock,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url, cache_url, settings.watch_poll_interval()).await?;
        Ok(Self::new(storage, settings, clock))
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// A sitting for `key`, not yet opened.
    #[must_use]
    pub fn sitting(&self, key: SittingKey) -> Arc<ExamSitting> {
        let sitting = ExamSitting::new(key, &self.storage, self.settings.clone(), self.clock.clone());
        let sitting = match &self.uploader {
            Some(uploader) => sitting.with_uploader(Arc::clone(uploader)),
            None => sitting,
        };
        Arc::new(sitting)
    }

    /// Topics with content for `program`, in configured order.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the catalog cannot be read.
    pub async fn available_topics(&self, program: ProgramId) -> Result<Vec<Topic>, AppServicesError> {
        let listed = self.storage.catalog.list_topics(program).await?;
        Ok(self
            .settings
            .topic_order()
            .topics()
            .iter()
            .filter(|topic| listed.contains(topic))
            .cloned()
            .collect())
    }

    /// Administrator hard delete of a student's sitting.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the store cannot be reached.
    pub async fn reset_sitting(&self, key: SittingKey) -> Result<bool, AppServicesError> {
        let removed = self.storage.sessions.delete_session(key.session_id()).await?;
        tracing::info!(session = %key.session_id(), removed, "sitting reset requested");
        Ok(removed)
    }
}
