mod fsm;
mod ledger;
mod sitting;
mod watcher;

// Public API of the sitting subsystem.
pub use crate::error::SittingError;
pub use fsm::{Completion, SittingContext, SittingState, SubmitReason};
pub use ledger::{AnswerLedger, LocalAnswer, MergeReport, WriteToken};
pub use sitting::{ExamSitting, SittingEvent, SittingKey, SittingView, SubmitOutcome};
pub use watcher::{Reconciliation, SessionWatcher, reconcile};
