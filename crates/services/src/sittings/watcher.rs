//! Remote change classification and the task that feeds it.

use std::sync::Arc;

use exam_core::model::{ExamSession, SessionId};
use storage::{SessionSubscription, WatchEvent};

use super::sitting::ExamSitting;

/// What a remote event means for the local sitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Transport trouble; keep everything and wait.
    Disconnected,
    /// The document looks gone. Confirm with a direct read before resetting.
    ConfirmAbsence,
    /// Remote is terminal: adopt it and enter review mode.
    Review(ExamSession),
    /// Locally submitted while the remote still lags behind. Never revert.
    KeepSubmitted,
    /// Merge answers and adopt the remote deadline.
    Merge(ExamSession),
    /// Snapshot of some other document.
    Foreign,
}

/// Classify `event` for the sitting bound to `session`.
#[must_use]
pub fn reconcile(session: SessionId, locally_submitted: bool, event: WatchEvent) -> Reconciliation {
    match event {
        WatchEvent::ConnectionLost => Reconciliation::Disconnected,
        WatchEvent::Missing => Reconciliation::ConfirmAbsence,
        WatchEvent::Snapshot(doc) if doc.id() != session => Reconciliation::Foreign,
        WatchEvent::Snapshot(doc) if doc.is_terminal() => Reconciliation::Review(doc),
        WatchEvent::Snapshot(_) if locally_submitted => Reconciliation::KeepSubmitted,
        WatchEvent::Snapshot(doc) => Reconciliation::Merge(doc),
    }
}

/// Applies every event of a subscription to one sitting, in order.
pub struct SessionWatcher {
    sitting: Arc<ExamSitting>,
    subscription: SessionSubscription,
}

impl SessionWatcher {
    #[must_use]
    pub fn new(sitting: Arc<ExamSitting>, subscription: SessionSubscription) -> Self {
        Self {
            sitting,
            subscription,
        }
    }

    /// Run until the subscription closes.
    pub async fn run(mut self) {
        while let Some(event) = self.subscription.next().await {
            if let Err(err) = self.sitting.apply_remote(event).await {
                tracing::warn!(session = %self.sitting.session_id(), error = %err, "remote change not applied");
            }
        }
        tracing::debug!(session = %self.sitting.session_id(), "session watch ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use exam_core::model::{ExamId, SessionStatus, StudentId};
    use exam_core::time::fixed_now;

    fn doc(student: u64) -> ExamSession {
        ExamSession::start(ExamId::new(1), StudentId::new(student), fixed_now(), Duration::minutes(90))
    }

    #[test]
    fn classifies_events() {
        let mine = doc(1);
        let id = mine.id();

        assert_eq!(reconcile(id, false, WatchEvent::ConnectionLost), Reconciliation::Disconnected);
        assert_eq!(reconcile(id, true, WatchEvent::Missing), Reconciliation::ConfirmAbsence);
        assert_eq!(
            reconcile(id, false, WatchEvent::Snapshot(doc(2))),
            Reconciliation::Foreign
        );
        assert_eq!(
            reconcile(id, true, WatchEvent::Snapshot(mine.clone())),
            Reconciliation::KeepSubmitted
        );
        assert_eq!(
            reconcile(id, false, WatchEvent::Snapshot(mine.clone())),
            Reconciliation::Merge(mine.clone())
        );

        let mut closed = mine;
        closed
            .close(SessionStatus::Submitted, Some(80), fixed_now())
            .unwrap();
        assert_eq!(
            reconcile(id, false, WatchEvent::Snapshot(closed.clone())),
            Reconciliation::Review(closed)
        );
    }
}
