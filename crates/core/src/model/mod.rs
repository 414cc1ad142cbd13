mod exam;
mod ids;
mod session;
mod settings;
mod topic;

pub use ids::{ExamId, ParseIdError, ProgramId, QuestionId, SessionId, StudentId};

pub use exam::{ExamDefinition, ExamError, Question, QuestionKind, TabularPayload};
pub use session::{AnswerValue, ExamSession, SessionModelError, SessionStatus};
pub use settings::{EngineSettings, EngineSettingsDraft, SettingsError};
pub use topic::{Topic, TopicError, TopicOrder, TopicProgress, TopicSelection};
