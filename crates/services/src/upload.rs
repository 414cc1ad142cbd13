//! File-answer uploads. The transport lives outside the engine; a sitting only
//! needs the reference URL that ends up stored as the answer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use exam_core::model::{QuestionId, SessionId};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UploadError {
    #[error("upload of {file_name} was empty")]
    Empty { file_name: String },
    #[error("upload rejected: {0}")]
    Rejected(String),
    #[error("upload returned an invalid reference: {0}")]
    InvalidReference(#[from] url::ParseError),
}

/// Absolute URL pointing at an uploaded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef(Url);

impl ArtifactRef {
    /// # Errors
    ///
    /// Returns `UploadError::InvalidReference` unless `raw` is an absolute URL.
    pub fn parse(raw: &str) -> Result<Self, UploadError> {
        Ok(Self(Url::parse(raw)?))
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    /// Store `bytes` and return where they can be fetched from.
    ///
    /// # Errors
    ///
    /// Returns `UploadError` if the artifact cannot be stored.
    async fn upload(
        &self,
        session: SessionId,
        question: QuestionId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, UploadError>;
}

/// Keeps uploads in memory under `{base}/{session}/{question}/{file_name}`.
#[derive(Clone)]
pub struct InMemoryUploader {
    base: Url,
    stored: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl InMemoryUploader {
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self {
            base,
            stored: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn get(&self, reference: &ArtifactRef) -> Option<Vec<u8>> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference.as_str())
            .cloned()
    }
}

#[async_trait]
impl ArtifactUploader for InMemoryUploader {
    async fn upload(
        &self,
        session: SessionId,
        question: QuestionId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty {
                file_name: file_name.to_owned(),
            });
        }
        let url = self
            .base
            .join(&format!("{session}/{question}/{file_name}"))?;
        let reference = ArtifactRef(url);
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.as_str().to_owned(), bytes);
        Ok(reference)
    }
}
