#![forbid(unsafe_code)]

pub mod app_services;
pub mod cache;
pub mod drivers;
pub mod error;
pub mod recorder;
pub mod retry;
pub mod sittings;
pub mod upload;

pub use exam_core::Clock;

pub use app_services::AppServices;
pub use cache::{CacheEntry, SittingCache};
pub use drivers::{SittingDrivers, TimerDriver};
pub use error::{AppServicesError, RecorderError, SittingError};
pub use recorder::{AnswerRecorder, FlushReport};
pub use retry::{RetryError, RetryPolicy};
pub use upload::{ArtifactRef, ArtifactUploader, InMemoryUploader, UploadError};

pub use sittings::{
    Completion, ExamSitting, SessionWatcher, SittingContext, SittingEvent, SittingKey,
    SittingState, SittingView, SubmitOutcome, SubmitReason,
};
