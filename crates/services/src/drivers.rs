//! Background tasks that keep a sitting live: the session watch and the
//! countdown tick.

use std::sync::Arc;

use exam_core::timer::Tick;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::SittingError;
use crate::sittings::{ExamSitting, SessionWatcher, SubmitReason};

/// Ticks a sitting on a fixed interval and keeps retrying a forced
/// submission that failed on expiry.
pub struct TimerDriver {
    sitting: Arc<ExamSitting>,
}

impl TimerDriver {
    #[must_use]
    pub fn new(sitting: Arc<ExamSitting>) -> Self {
        Self { sitting }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.sitting.settings().tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut expiry_pending = false;

        loop {
            interval.tick().await;

            let result = if expiry_pending {
                self.sitting
                    .force_submit(SubmitReason::TimeExpired)
                    .await
                    .map(|_| Tick::Stopped)
            } else {
                self.sitting.tick().await
            };

            match result {
                Ok(Tick::Running { remaining_seconds }) => {
                    tracing::trace!(session = %self.sitting.session_id(), remaining_seconds, "tick");
                }
                Ok(_) => expiry_pending = false,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(session = %self.sitting.session_id(), error = %err, "forced submission failed, will retry");
                    expiry_pending = true;
                }
                Err(SittingError::Superseded) => expiry_pending = false,
                Err(err) => {
                    tracing::error!(session = %self.sitting.session_id(), error = %err, "forced submission abandoned");
                    expiry_pending = false;
                }
            }
        }
    }
}

/// Owns the watch and timer tasks of one sitting. Dropping it stops both.
pub struct SittingDrivers {
    watcher: JoinHandle<()>,
    timer: JoinHandle<()>,
}

impl SittingDrivers {
    /// Subscribe to the session document and start both tasks.
    ///
    /// # Errors
    ///
    /// Returns `SittingError` if the watch cannot be established.
    pub async fn spawn(sitting: Arc<ExamSitting>) -> Result<Self, SittingError> {
        let subscription = sitting.subscribe().await?;
        let watcher = tokio::spawn(SessionWatcher::new(Arc::clone(&sitting), subscription).run());
        let timer = tokio::spawn(TimerDriver::new(sitting).run());
        Ok(Self { watcher, timer })
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.watcher.is_finished() && !self.timer.is_finished()
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for SittingDrivers {
    fn drop(&mut self) {
        self.watcher.abort();
        self.timer.abort();
    }
}
