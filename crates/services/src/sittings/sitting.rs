use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use exam_core::Clock;
use exam_core::model::{
    AnswerValue, EngineSettings, ExamDefinition, ExamId, ExamSession, ProgramId, Question,
    QuestionId, QuestionKind, SessionId, SessionStatus, StudentId, Topic, TopicSelection,
};
use exam_core::scoring::{self, ScoreReport};
use exam_core::timer::{Countdown, Tick};
use serde::Serialize;
use storage::repository::{ContentCatalog, SessionStore, Storage, StorageError};
use storage::{SessionSubscription, WatchEvent};
use tokio::sync::{Mutex, broadcast, watch};

use super::fsm::{Completion, SittingContext, SittingState, SubmitReason};
use super::ledger::{AnswerLedger, WriteToken};
use super::watcher::{Reconciliation, reconcile};
use crate::cache::SittingCache;
use crate::error::{RecorderError, SittingError};
use crate::recorder::AnswerRecorder;
use crate::retry::{RetryError, RetryPolicy, retry_transient};
use crate::upload::ArtifactUploader;

//
// ─── PUBLIC TYPES ──────────────────────────────────────────────────────────────
//

/// Who sits which exam, and where its content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SittingKey {
    pub exam: ExamId,
    pub student: StudentId,
    pub program: ProgramId,
}

impl SittingKey {
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        SessionId::for_sitting(self.exam, self.student)
    }
}

/// Read model for a caller rendering the sitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SittingView {
    pub session_id: SessionId,
    pub state: SittingState,
    pub remaining_seconds: Option<u64>,
    pub question_index: usize,
    pub completed_topics: Vec<Topic>,
    pub answers: BTreeMap<QuestionId, AnswerValue>,
    pub pending_answers: usize,
    pub final_score: Option<u8>,
    pub connected: bool,
    /// Bumped on every administrator reset.
    pub generation: u64,
}

/// Notable changes, broadcast to every listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SittingEvent {
    Started(TopicSelection),
    TopicCompleted {
        selection: TopicSelection,
        completion: Completion,
    },
    Expired,
    Submitted {
        reason: SubmitReason,
        score: u8,
    },
    /// The remote document is terminal; the sitting is read-only now.
    Review(SessionStatus),
    /// An administrator deleted the session; all local state was cleared.
    Reset,
    ConnectionLost,
    Reconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Submitted(ScoreReport),
    AlreadySubmitted,
}

//
// ─── SITTING ───────────────────────────────────────────────────────────────────
//

struct Stage {
    questions: Vec<Question>,
    duration: chrono::Duration,
}

struct SittingInner {
    ctx: SittingContext,
    session: Option<ExamSession>,
    ledger: AnswerLedger,
    countdown: Option<Countdown>,
    questions: Vec<Question>,
    final_score: Option<u8>,
    generation: u64,
    connected: bool,
}

impl SittingInner {
    fn new(ctx: SittingContext) -> Self {
        Self {
            ctx,
            session: None,
            ledger: AnswerLedger::new(),
            countdown: None,
            questions: Vec::new(),
            final_score: None,
            generation: 0,
            connected: true,
        }
    }

    fn ensure_generation(&self, generation: u64) -> Result<(), SittingError> {
        if self.generation == generation {
            Ok(())
        } else {
            Err(SittingError::Superseded)
        }
    }

    fn open_session(&self) -> Result<&ExamSession, SittingError> {
        match &self.session {
            Some(session) if session.is_terminal() => Err(SittingError::SessionClosed),
            Some(session) => Ok(session),
            None => Err(SittingError::NoActiveSession),
        }
    }

    fn invalid(&self, action: &'static str) -> SittingError {
        SittingError::InvalidTransition {
            action,
            state: self.ctx.state().to_string(),
        }
    }
}

/// One student's sitting of one exam.
///
/// Local operations, timer ticks and remote changes all go through here.
/// Store I/O never runs while the state lock is held; every mutation that
/// awaited I/O re-checks the reset generation before applying its result.
pub struct ExamSitting {
    key: SittingKey,
    session_id: SessionId,
    clock: Clock,
    settings: EngineSettings,
    store: Arc<dyn SessionStore>,
    catalog: Arc<dyn ContentCatalog>,
    cache: SittingCache,
    recorder: AnswerRecorder,
    policy: RetryPolicy,
    uploader: Option<Arc<dyn ArtifactUploader>>,
    inner: Mutex<SittingInner>,
    submit_flight: Mutex<()>,
    view_tx: watch::Sender<SittingView>,
    events: broadcast::Sender<SittingEvent>,
}

impl fmt::Debug for ExamSitting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExamSitting")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl ExamSitting {
    #[must_use]
    pub fn new(key: SittingKey, storage: &Storage, settings: EngineSettings, clock: Clock) -> Self {
        let session_id = key.session_id();
        let policy = RetryPolicy::from_settings(&settings);
        let inner = SittingInner::new(SittingContext::new(settings.topic_order().clone()));
        let (view_tx, _) = watch::channel(Self::project(session_id, &inner, clock.now()));
        let (events, _) = broadcast::channel(64);
        Self {
            key,
            session_id,
            store: Arc::clone(&storage.sessions),
            catalog: Arc::clone(&storage.catalog),
            cache: SittingCache::new(Arc::clone(&storage.cache), session_id),
            recorder: AnswerRecorder::new(Arc::clone(&storage.sessions), policy),
            policy,
            clock,
            settings,
            uploader: None,
            inner: Mutex::new(inner),
            submit_flight: Mutex::new(()),
            view_tx,
            events,
        }
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: Arc<dyn ArtifactUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    #[must_use]
    pub fn key(&self) -> SittingKey {
        self.key
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn view(&self) -> SittingView {
        let inner = self.inner.lock().await;
        Self::project(self.session_id, &inner, self.clock.now())
    }

    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<SittingView> {
        self.view_tx.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SittingEvent> {
        self.events.subscribe()
    }

    /// Questions of the open topic, in order.
    pub async fn questions(&self) -> Vec<Question> {
        self.inner.lock().await.questions.clone()
    }

    /// Open a watch on this sitting's document.
    ///
    /// # Errors
    ///
    /// Returns `SittingError` if the store cannot establish the watch.
    pub async fn subscribe(&self) -> Result<SessionSubscription, SittingError> {
        Ok(retry_transient(self.policy, "subscribe", || {
            self.store.subscribe(self.session_id)
        })
        .await?)
    }

    // ─── LIFECYCLE ─────────────────────────────────────────────────────────────

    /// Resume after a (re)load.
    ///
    /// Restores the cached completed topics and deadline, then reconciles
    /// with the remote document. When the store is unreachable the cached
    /// state is kept and the watcher reconciles later.
    ///
    /// # Errors
    ///
    /// Returns `SittingError` if an elapsed deadline cannot be enforced.
    pub async fn open(&self) -> Result<SittingView, SittingError> {
        let cached_deadline = self.cache.load_deadline().await;
        let cached_completed = self.cache.load_completed().await;
        let remote = retry_transient(self.policy, "load session", || {
            self.store.get_session(self.session_id)
        })
        .await;
        let now = self.clock.now();

        let overdue = {
            let mut inner = self.inner.lock().await;
            inner.ctx = SittingContext::restore(self.settings.topic_order().clone(), cached_completed);
            match remote {
                Ok(Some(doc)) if doc.is_terminal() => {
                    self.enter_review(&mut inner, doc, now);
                    false
                }
                Ok(Some(doc)) => self.adopt_in_progress(&mut inner, doc, now).await,
                Ok(None) => {
                    // Whatever the cache holds belongs to a session that no longer exists.
                    self.cache.purge().await;
                    inner.ctx = SittingContext::new(self.settings.topic_order().clone());
                    false
                }
                Err(err) => {
                    tracing::warn!(session = %self.session_id, error = ?err, "store unreachable, resuming from cache");
                    inner.connected = false;
                    inner.countdown = cached_deadline.map(Countdown::new);
                    false
                }
            }
        };
        self.publish().await;

        if overdue {
            self.force_submit(SubmitReason::TimeExpired).await?;
        }
        Ok(self.view().await)
    }

    /// Start `selection`, creating the session document on first start.
    ///
    /// # Errors
    ///
    /// Returns `ContentUnavailable` when no active definition resolves,
    /// `TopicAlreadyCompleted`/`InvalidTransition` for rejected transitions,
    /// `SessionClosed` once the session is terminal and `PersistenceFatal`
    /// when the document cannot be created.
    pub async fn start(&self, selection: TopicSelection) -> Result<SittingView, SittingError> {
        let (generation, existing) = {
            let inner = self.inner.lock().await;
            if inner.ctx.is_submitted() {
                return Err(SittingError::SessionClosed);
            }
            inner.ctx.can_start(&selection)?;
            (inner.generation, inner.session.clone())
        };

        let stage = self.load_stage(&selection).await?;

        let created = match existing {
            Some(_) => None,
            None => {
                let draft = ExamSession::start(
                    self.key.exam,
                    self.key.student,
                    self.clock.now(),
                    stage.duration,
                );
                let stored = retry_transient(self.policy, "create session", || {
                    self.store.create_session(&draft)
                })
                .await?;
                Some(stored)
            }
        };

        let now = self.clock.now();
        let overdue = {
            let mut inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            let overdue = match created {
                Some(doc) if doc.is_terminal() => {
                    self.enter_review(&mut inner, doc, now);
                    drop(inner);
                    self.publish().await;
                    return Err(SittingError::SessionClosed);
                }
                Some(doc) => self.adopt_in_progress(&mut inner, doc, now).await,
                None => inner
                    .session
                    .as_ref()
                    .is_some_and(|session| session.is_past_deadline(now)),
            };
            if !overdue {
                inner.ctx.start(selection.clone(), stage.questions.len())?;
                inner.questions = stage.questions;
                tracing::info!(session = %self.session_id, topic = %selection, "topic started");
                self.emit(SittingEvent::Started(selection));
            }
            overdue
        };
        self.publish().await;

        if overdue {
            self.force_submit(SubmitReason::TimeExpired).await?;
            return Err(SittingError::SessionClosed);
        }
        Ok(self.view().await)
    }

    // ─── ANSWERS ───────────────────────────────────────────────────────────────

    /// Record an answer for a question of the open topic.
    ///
    /// The value is kept locally even when persistence fails, and goes out
    /// again with the next flush. When the write finds the document deleted
    /// by an administrator, the sitting resets and this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownQuestion`/`AnswerMismatch` for invalid answers,
    /// `PersistenceFatal` when retries are exhausted and `Superseded` if a
    /// reset happened while the write was in flight.
    pub async fn answer(&self, question: QuestionId, value: AnswerValue) -> Result<(), SittingError> {
        let now = self.clock.now();
        let (generation, session_id, token) = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            if inner.ctx.is_submitted() {
                return Err(SittingError::SessionClosed);
            }
            if inner.ctx.current_selection().is_none() {
                return Err(inner.invalid("answer a question"));
            }
            let session_id = inner.open_session()?.id();
            let target = inner
                .questions
                .iter()
                .find(|q| q.id() == question)
                .ok_or(SittingError::UnknownQuestion(question))?;
            check_answer(target, &value)?;
            let token = inner.ledger.write(question, value.clone(), now);
            (inner.generation, session_id, token)
        };
        self.publish().await;

        let result = self.recorder.record(session_id, question, &value).await;

        if let Err(RecorderError::Rejected {
            source: StorageError::NotFound,
            ..
        }) = &result
        {
            // The document was deleted under us. The value belongs to a
            // session that no longer exists; the reset is reported through
            // `events()`.
            if self.reset_if_deleted(generation).await {
                return Ok(());
            }
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            match result {
                Ok(()) => {
                    inner.ledger.mark_flushed(token);
                    Ok(())
                }
                Err(err) => Err(SittingError::from(err)),
            }
        };
        self.publish().await;
        outcome
    }

    /// Upload a file answer and record its reference.
    ///
    /// # Errors
    ///
    /// Returns `UploadUnavailable` without an uploader, `Upload` when the
    /// upload fails and any error from [`Self::answer`].
    pub async fn answer_with_upload(
        &self,
        question: QuestionId,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), SittingError> {
        let uploader = self.uploader.as_ref().ok_or(SittingError::UploadUnavailable)?;
        {
            let inner = self.inner.lock().await;
            inner.open_session()?;
            let target = inner
                .questions
                .iter()
                .find(|q| q.id() == question)
                .ok_or(SittingError::UnknownQuestion(question))?;
            if target.is_choice() {
                return Err(SittingError::AnswerMismatch(question));
            }
        }
        let reference = uploader
            .upload(self.session_id, question, file_name, bytes)
            .await?;
        tracing::debug!(session = %self.session_id, question = %question, reference = %reference, "artifact uploaded");
        self.answer(question, AnswerValue::Reference(reference.to_string()))
            .await
    }

    // ─── PROGRESSION ───────────────────────────────────────────────────────────

    /// Move to another question of the open topic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` or `QuestionIndexOutOfRange`.
    pub async fn move_to_question(&self, index: usize) -> Result<usize, SittingError> {
        let moved = self.inner.lock().await.ctx.move_to_question(index)?;
        self.publish().await;
        Ok(moved)
    }

    /// Leave the open topic without completing it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when no topic is open.
    pub async fn return_to_selection(&self) -> Result<(), SittingError> {
        {
            let mut inner = self.inner.lock().await;
            inner.ctx.return_to_selection()?;
            inner.questions.clear();
        }
        self.publish().await;
        Ok(())
    }

    /// Complete `selection` after flushing its pending answers.
    ///
    /// Completing an already-completed topic is a no-op. The sitting stays in
    /// the topic until every pending answer is persisted. If the flush finds
    /// the document deleted, the sitting resets and `BackToSelection` is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFatal` when pending answers cannot be flushed and
    /// `InvalidTransition` when `selection` is not the open topic.
    pub async fn complete_topic(&self, selection: &TopicSelection) -> Result<Completion, SittingError> {
        let (generation, session_id, pending) = {
            let inner = self.inner.lock().await;
            if inner.ctx.is_completed(selection) {
                return Ok(Completion::AlreadyCompleted);
            }
            if inner.ctx.current_selection() != Some(selection) {
                return Err(inner.invalid("complete a topic that is not open"));
            }
            let session_id = inner.open_session()?.id();
            (inner.generation, session_id, inner.ledger.pending())
        };

        match self.flush_pending(generation, session_id, &pending).await? {
            None => {}
            Some(RecorderError::Rejected {
                source: StorageError::NotFound,
                ..
            }) => {
                if self.reset_if_deleted(generation).await {
                    return Ok(Completion::BackToSelection);
                }
                return Err(SittingError::Storage(StorageError::NotFound));
            }
            Some(err) => return Err(err.into()),
        }

        let advanced_to = {
            let mut inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            let completion = inner.ctx.complete(selection)?;
            inner.questions.clear();
            self.cache.store_completed(inner.ctx.completed()).await;
            tracing::info!(session = %self.session_id, topic = %selection, ?completion, "topic completed");
            self.emit(SittingEvent::TopicCompleted {
                selection: selection.clone(),
                completion: completion.clone(),
            });
            match completion {
                Completion::Advanced(next) => next,
                other => {
                    drop(inner);
                    self.publish().await;
                    return Ok(other);
                }
            }
        };

        let next = TopicSelection::Single(advanced_to.clone());
        let stage = self.load_stage(&next).await;
        let completion = {
            let mut inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            if inner.ctx.current_selection() != Some(&next) {
                Completion::Advanced(advanced_to)
            } else {
                match stage {
                    Ok(stage) => {
                        inner.ctx.set_question_count(stage.questions.len());
                        inner.questions = stage.questions;
                        Completion::Advanced(advanced_to)
                    }
                    Err(err) => {
                        tracing::warn!(session = %self.session_id, topic = %next, error = %err, "next topic unavailable");
                        inner.ctx.return_to_selection()?;
                        Completion::BackToSelection
                    }
                }
            }
        };
        self.publish().await;
        Ok(completion)
    }

    /// Finalize the sitting: flush answers, score the full question set and
    /// write `SUBMITTED` with the score.
    ///
    /// Submissions are single-flight; any call after the first success is a
    /// no-op reported as `AlreadySubmitted`.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` before any topic was started,
    /// `PersistenceFatal` when the store stays unreachable and `Superseded`
    /// when a reset wins the race.
    pub async fn force_submit(&self, reason: SubmitReason) -> Result<SubmitOutcome, SittingError> {
        let _flight = self.submit_flight.lock().await;

        let (generation, session_id, pending) = {
            let inner = self.inner.lock().await;
            if inner.ctx.is_submitted() {
                return Ok(SubmitOutcome::AlreadySubmitted);
            }
            let session = inner.session.as_ref().ok_or(SittingError::NoActiveSession)?;
            if session.is_terminal() {
                return Ok(SubmitOutcome::AlreadySubmitted);
            }
            (inner.generation, session.id(), inner.ledger.pending())
        };
        tracing::info!(session = %session_id, %reason, "submitting sitting");

        match self.flush_pending(generation, session_id, &pending).await? {
            None
            | Some(RecorderError::Rejected {
                source: StorageError::Conflict(_),
                ..
            }) => {}
            Some(RecorderError::Rejected {
                source: StorageError::NotFound,
                ..
            }) => return Err(SittingError::Superseded),
            Some(err) => return Err(err.into()),
        }

        let answers = {
            let inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            inner.ledger.values()
        };
        let questions = self.full_question_set().await?;
        let report = scoring::score(&questions, &answers);
        let now = self.clock.now();

        let written = retry_transient(self.policy, "submit session", || {
            self.store
                .set_status(session_id, SessionStatus::Submitted, Some(report.score), now)
        })
        .await;
        let changed = match written {
            Ok(changed) => changed,
            // Someone else moved the document to a terminal status first.
            Err(RetryError::Permanent(StorageError::Conflict(_))) => false,
            Err(RetryError::Permanent(StorageError::NotFound)) => {
                return Err(SittingError::Superseded);
            }
            Err(err) => return Err(err.into()),
        };

        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.ensure_generation(generation)?;
            inner.ctx.mark_submitted();
            inner.questions.clear();
            if let Some(countdown) = inner.countdown.as_mut() {
                countdown.stop();
            }
            if changed {
                if let Some(session) = inner.session.as_mut() {
                    if let Err(err) = session.close(SessionStatus::Submitted, Some(report.score), now) {
                        tracing::warn!(session = %session_id, error = %err, "local mirror out of step");
                    }
                }
                inner.final_score = Some(report.score);
                tracing::info!(
                    session = %session_id,
                    %reason,
                    score = report.score,
                    pending_manual = report.pending_manual,
                    "sitting submitted"
                );
                self.emit(SittingEvent::Submitted {
                    reason,
                    score: report.score,
                });
                SubmitOutcome::Submitted(report)
            } else {
                tracing::info!(session = %session_id, "sitting was already finalized elsewhere");
                SubmitOutcome::AlreadySubmitted
            }
        };
        self.publish().await;
        Ok(outcome)
    }

    /// Submit on the student's explicit confirmation.
    ///
    /// # Errors
    ///
    /// Returns `ConfirmationRequired` when topics remain open and
    /// `acknowledge_incomplete` is false, and any error of
    /// [`Self::force_submit`].
    pub async fn confirm_final(
        &self,
        acknowledge_incomplete: bool,
    ) -> Result<SubmitOutcome, SittingError> {
        {
            let inner = self.inner.lock().await;
            if inner.ctx.is_submitted() {
                return Ok(SubmitOutcome::AlreadySubmitted);
            }
            inner.ctx.check_confirm_final(acknowledge_incomplete)?;
        }
        self.force_submit(SubmitReason::UserRequested).await
    }

    // ─── DRIVERS ───────────────────────────────────────────────────────────────

    /// Advance the countdown; the first tick at or past the deadline submits.
    ///
    /// # Errors
    ///
    /// Returns the error of the forced submission on expiry.
    pub async fn tick(&self) -> Result<Tick, SittingError> {
        let tick = {
            let mut inner = self.inner.lock().await;
            let now = self.clock.now();
            inner
                .countdown
                .as_mut()
                .map_or(Tick::Stopped, |countdown| countdown.tick(now))
        };
        self.publish().await;

        if tick == Tick::Expired {
            tracing::info!(session = %self.session_id, "deadline reached");
            self.emit(SittingEvent::Expired);
            self.force_submit(SubmitReason::TimeExpired).await?;
        }
        Ok(tick)
    }

    /// Apply one remote change, in receive order.
    ///
    /// # Errors
    ///
    /// Returns the error of a forced submission triggered by an elapsed
    /// deadline.
    pub async fn apply_remote(&self, event: WatchEvent) -> Result<(), SittingError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let overdue = match reconcile(self.session_id, inner.ctx.is_submitted(), event) {
            Reconciliation::Foreign => return Ok(()),
            Reconciliation::Disconnected => {
                if inner.connected {
                    inner.connected = false;
                    tracing::warn!(session = %self.session_id, "connection to session store lost");
                    self.emit(SittingEvent::ConnectionLost);
                }
                false
            }
            Reconciliation::ConfirmAbsence => {
                self.confirm_absence_locked(&mut inner).await;
                false
            }
            Reconciliation::Review(doc) => {
                self.mark_connected(&mut inner);
                let already = inner.ctx.is_submitted()
                    && inner.session.as_ref().is_some_and(ExamSession::is_terminal);
                if already {
                    inner.final_score = doc.final_score().or(inner.final_score);
                    inner.session = Some(doc);
                } else {
                    self.enter_review(&mut inner, doc, now);
                }
                false
            }
            Reconciliation::KeepSubmitted => {
                self.mark_connected(&mut inner);
                false
            }
            Reconciliation::Merge(doc) => {
                self.mark_connected(&mut inner);
                self.adopt_in_progress(&mut inner, doc, now).await
            }
        };
        drop(inner);
        self.publish().await;

        if overdue {
            tracing::info!(session = %self.session_id, "deadline elapsed while away");
            self.force_submit(SubmitReason::TimeExpired).await?;
        }
        Ok(())
    }

    // ─── INTERNALS ─────────────────────────────────────────────────────────────

    /// Adopt an in-progress document. Returns whether its deadline has passed.
    async fn adopt_in_progress(
        &self,
        inner: &mut SittingInner,
        doc: ExamSession,
        now: DateTime<Utc>,
    ) -> bool {
        let end_time = doc.end_time();
        let deadline_changed = match inner.countdown.as_mut() {
            Some(countdown) if countdown.end_time() == end_time => false,
            Some(countdown) => {
                countdown.retarget(end_time, now);
                true
            }
            None => {
                inner.countdown = Some(Countdown::new(end_time));
                true
            }
        };
        if deadline_changed {
            self.cache.store_deadline(end_time).await;
        }
        let merge = inner.ledger.merge_remote(doc.answers(), now);
        tracing::debug!(session = %self.session_id, ?merge, "merged remote answers");
        let overdue = doc.is_past_deadline(now);
        inner.session = Some(doc);
        overdue
    }

    fn enter_review(&self, inner: &mut SittingInner, doc: ExamSession, now: DateTime<Utc>) {
        tracing::info!(session = %self.session_id, status = %doc.status(), "session closed remotely");
        inner.ledger.replace_with_remote(doc.answers(), now);
        if let Some(countdown) = inner.countdown.as_mut() {
            countdown.stop();
        }
        inner.ctx.mark_submitted();
        inner.questions.clear();
        inner.final_score = doc.final_score();
        self.emit(SittingEvent::Review(doc.status()));
        inner.session = Some(doc);
    }

    /// Re-read the document and reset if it is really gone. Returns whether
    /// local state was reset.
    ///
    /// Runs under the lock so a concurrent first start cannot slip between
    /// the check and the reset.
    async fn confirm_absence_locked(&self, inner: &mut SittingInner) -> bool {
        match self.store.get_session(self.session_id).await {
            Ok(Some(_)) => {
                tracing::debug!(session = %self.session_id, "ignoring stale missing event");
                false
            }
            Ok(None) => {
                self.mark_connected(inner);
                let has_local_state = inner.session.is_some()
                    || !inner.ctx.completed().is_empty()
                    || inner.ctx.state() != &SittingState::SelectingTopic;
                if has_local_state {
                    self.reset_locked(inner).await;
                } else {
                    self.cache.purge().await;
                }
                has_local_state
            }
            Err(err) => {
                tracing::warn!(session = %self.session_id, error = %err, "cannot confirm session absence");
                inner.connected = false;
                false
            }
        }
    }

    /// A write came back `NotFound`: treat it as an administrator reset if
    /// the store agrees. Returns whether the sitting was (or already had
    /// been) reset since `generation`.
    async fn reset_if_deleted(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let reset = inner.generation != generation || self.confirm_absence_locked(&mut inner).await;
        drop(inner);
        self.publish().await;
        reset
    }

    async fn reset_locked(&self, inner: &mut SittingInner) {
        inner.generation += 1;
        inner.ctx.reset();
        inner.ledger.clear();
        inner.session = None;
        inner.countdown = None;
        inner.questions.clear();
        inner.final_score = None;
        let failures = self.cache.purge().await;
        tracing::info!(session = %self.session_id, generation = inner.generation, failures, "sitting reset by administrator");
        self.emit(SittingEvent::Reset);
    }

    fn mark_connected(&self, inner: &mut SittingInner) {
        if !inner.connected {
            inner.connected = true;
            tracing::info!(session = %self.session_id, "connection to session store restored");
            self.emit(SittingEvent::Reconnected);
        }
    }

    /// Flush `pending` and acknowledge what made it. The recorder failure,
    /// if any, is returned for the caller to interpret.
    async fn flush_pending(
        &self,
        generation: u64,
        session_id: SessionId,
        pending: &[(WriteToken, AnswerValue)],
    ) -> Result<Option<RecorderError>, SittingError> {
        if pending.is_empty() {
            return Ok(None);
        }
        let batch: Vec<(QuestionId, AnswerValue)> = pending
            .iter()
            .map(|(token, value)| (token.question, value.clone()))
            .collect();
        let report = self.recorder.flush(session_id, &batch).await;

        let mut inner = self.inner.lock().await;
        inner.ensure_generation(generation)?;
        for (token, _) in pending {
            if report.flushed.contains(&token.question) {
                inner.ledger.mark_flushed(*token);
            }
        }
        Ok(report.error)
    }

    async fn fetch_definition(&self, topic: &Topic) -> Result<Option<ExamDefinition>, SittingError> {
        let definition = retry_transient(self.policy, "load exam content", || {
            self.catalog.exam_for(self.key.program, topic)
        })
        .await?;
        Ok(definition.filter(|d| d.is_active() && !d.questions().is_empty()))
    }

    async fn load_stage(&self, selection: &TopicSelection) -> Result<Stage, SittingError> {
        let mut definitions = Vec::new();
        match selection {
            TopicSelection::Single(topic) => definitions.extend(self.fetch_definition(topic).await?),
            TopicSelection::Combined => {
                for topic in self.settings.topic_order().topics() {
                    definitions.extend(self.fetch_definition(topic).await?);
                }
            }
        }
        let Some(first) = definitions.first() else {
            return Err(SittingError::ContentUnavailable {
                selection: selection.clone(),
            });
        };
        Ok(Stage {
            duration: first.duration(),
            questions: union_questions(&definitions),
        })
    }

    async fn full_question_set(&self) -> Result<Vec<Question>, SittingError> {
        let mut definitions = Vec::new();
        for topic in self.settings.topic_order().topics() {
            definitions.extend(self.fetch_definition(topic).await?);
        }
        Ok(union_questions(&definitions))
    }

    fn emit(&self, event: SittingEvent) {
        // No listeners is fine.
        let _ = self.events.send(event);
    }

    async fn publish(&self) {
        let view = self.view().await;
        self.view_tx.send_replace(view);
    }

    fn project(session_id: SessionId, inner: &SittingInner, now: DateTime<Utc>) -> SittingView {
        SittingView {
            session_id,
            state: inner.ctx.state().clone(),
            remaining_seconds: inner
                .countdown
                .as_ref()
                .map(|countdown| countdown.remaining_seconds(now)),
            question_index: inner.ctx.question_index(),
            completed_topics: inner.ctx.completed().iter().cloned().collect(),
            answers: inner.ledger.values(),
            pending_answers: inner.ledger.pending_count(),
            final_score: inner.final_score,
            connected: inner.connected,
            generation: inner.generation,
        }
    }
}

/// Questions of every definition in order, first occurrence of an id wins.
fn union_questions(definitions: &[ExamDefinition]) -> Vec<Question> {
    let mut seen = BTreeSet::new();
    definitions
        .iter()
        .flat_map(ExamDefinition::questions)
        .filter(|q| seen.insert(q.id()))
        .cloned()
        .collect()
}

fn check_answer(question: &Question, value: &AnswerValue) -> Result<(), SittingError> {
    let fits = match (question.kind(), value) {
        (QuestionKind::Choice { .. }, AnswerValue::Choice(index)) => {
            usize::try_from(*index).is_ok_and(|i| i < question.option_count())
        }
        (QuestionKind::Essay, AnswerValue::Reference(reference)) => !reference.trim().is_empty(),
        _ => false,
    };
    if fits {
        Ok(())
    } else {
        Err(SittingError::AnswerMismatch(question.id()))
    }
}
