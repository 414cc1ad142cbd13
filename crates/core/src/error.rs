use thiserror::Error;

use crate::model::{ExamError, SessionModelError, SettingsError, TopicError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Exam(#[from] ExamError),
    #[error(transparent)]
    Session(#[from] SessionModelError),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}
