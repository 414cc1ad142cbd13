use std::path::{Path, PathBuf};

use async_trait::async_trait;
use exam_core::model::{QuestionId, SessionId};
use services::{ArtifactRef, ArtifactUploader, UploadError};
use url::Url;

/// Writes uploaded artifacts under `{root}/{session}/{question}/` and
/// answers with their `file://` URL.
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    /// # Errors
    ///
    /// Returns `UploadError::Rejected` if the root cannot be created or
    /// resolved to an absolute path.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, UploadError> {
        std::fs::create_dir_all(root.as_ref()).map_err(|e| UploadError::Rejected(e.to_string()))?;
        let root = std::fs::canonicalize(root.as_ref())
            .map_err(|e| UploadError::Rejected(e.to_string()))?;
        Ok(Self { root })
    }
}

fn sanitize(file_name: &str) -> Option<&str> {
    let name = Path::new(file_name).file_name()?.to_str()?;
    (!name.trim().is_empty()).then_some(name)
}

#[async_trait]
impl ArtifactUploader for DirectoryUploader {
    async fn upload(
        &self,
        session: SessionId,
        question: QuestionId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty {
                file_name: file_name.to_string(),
            });
        }
        let name = sanitize(file_name)
            .ok_or_else(|| UploadError::Rejected(format!("invalid file name: {file_name}")))?;

        let dir = self.root.join(session.to_string()).join(question.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| UploadError::Rejected(e.to_string()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| UploadError::Rejected(e.to_string()))?;

        let url = Url::from_file_path(&path)
            .map_err(|()| UploadError::Rejected(format!("not an absolute path: {}", path.display())))?;
        ArtifactRef::parse(url.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exam_core::model::{ExamId, StudentId};

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("exam-uploads-{tag}-{}", std::process::id()))
    }

    #[tokio::test]
    async fn writes_file_and_returns_file_url() {
        let root = temp_root("write");
        let uploader = DirectoryUploader::new(&root).unwrap();
        let session = SessionId::for_sitting(ExamId::new(1), StudentId::new(2));

        let reference = uploader
            .upload(session, QuestionId::new(9), "../memo.docx", b"memo".to_vec())
            .await
            .unwrap();

        assert_eq!(reference.url().scheme(), "file");
        assert!(reference.as_str().ends_with("/9/memo.docx"));
        let path = reference.url().to_file_path().unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"memo");

        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn rejects_empty_payload() {
        let root = temp_root("empty");
        let uploader = DirectoryUploader::new(&root).unwrap();
        let session = SessionId::for_sitting(ExamId::new(1), StudentId::new(2));

        let err = uploader
            .upload(session, QuestionId::new(1), "a.xlsx", Vec::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Empty { .. }));
        let _ = std::fs::remove_dir_all(root);
    }
}
