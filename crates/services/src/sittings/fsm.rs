use std::fmt;

use exam_core::model::{Topic, TopicOrder, TopicProgress, TopicSelection};
use serde::Serialize;

use crate::error::SittingError;

//
// ─── STATE ─────────────────────────────────────────────────────────────────────
//

/// Where a student is within a sitting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "selection", rename_all = "snake_case")]
pub enum SittingState {
    SelectingTopic,
    InTopic(TopicSelection),
    AllComplete,
    Submitted,
}

impl fmt::Display for SittingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SittingState::SelectingTopic => f.write_str("selecting a topic"),
            SittingState::InTopic(selection) => write!(f, "in topic {selection}"),
            SittingState::AllComplete => f.write_str("all topics complete"),
            SittingState::Submitted => f.write_str("submitted"),
        }
    }
}

/// Why a sitting is being finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitReason {
    TimeExpired,
    UserRequested,
    Emergency,
}

impl fmt::Display for SubmitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmitReason::TimeExpired => "time expired",
            SubmitReason::UserRequested => "user requested",
            SubmitReason::Emergency => "emergency",
        })
    }
}

/// Result of completing a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The topic was already completed; nothing changed.
    AlreadyCompleted,
    /// Auto-advanced to the next open topic in order.
    Advanced(Topic),
    AllComplete,
    /// Open topics remain, but none after this one.
    BackToSelection,
}

//
// ─── CONTEXT ───────────────────────────────────────────────────────────────────
//

/// Everything the progression needs to decide a transition.
///
/// Transitions are plain methods with no I/O; the caller persists first and
/// applies the transition once persistence succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SittingContext {
    state: SittingState,
    order: TopicOrder,
    completed: TopicProgress,
    question_index: usize,
    question_count: usize,
}

impl SittingContext {
    #[must_use]
    pub fn new(order: TopicOrder) -> Self {
        Self {
            state: SittingState::SelectingTopic,
            order,
            completed: TopicProgress::new(),
            question_index: 0,
            question_count: 0,
        }
    }

    /// Rebuild after a reload from the cached completed-topic set.
    #[must_use]
    pub fn restore(order: TopicOrder, completed: TopicProgress) -> Self {
        let state = if completed.covers(&order) {
            SittingState::AllComplete
        } else {
            SittingState::SelectingTopic
        };
        Self {
            state,
            order,
            completed,
            question_index: 0,
            question_count: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> &SittingState {
        &self.state
    }

    #[must_use]
    pub fn order(&self) -> &TopicOrder {
        &self.order
    }

    #[must_use]
    pub fn completed(&self) -> &TopicProgress {
        &self.completed
    }

    #[must_use]
    pub fn question_index(&self) -> usize {
        self.question_index
    }

    #[must_use]
    pub fn question_count(&self) -> usize {
        self.question_count
    }

    #[must_use]
    pub fn is_submitted(&self) -> bool {
        self.state == SittingState::Submitted
    }

    #[must_use]
    pub fn current_selection(&self) -> Option<&TopicSelection> {
        match &self.state {
            SittingState::InTopic(selection) => Some(selection),
            _ => None,
        }
    }

    /// Whether `selection` counts as done.
    #[must_use]
    pub fn is_completed(&self, selection: &TopicSelection) -> bool {
        match selection {
            TopicSelection::Single(topic) => self.completed.contains(topic),
            TopicSelection::Combined => self.completed.covers(&self.order),
        }
    }

    /// Check that `selection` may be started, without changing state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` outside topic selection, `UnknownTopic` for
    /// topics outside the order and `TopicAlreadyCompleted` for finished topics.
    pub fn can_start(&self, selection: &TopicSelection) -> Result<(), SittingError> {
        if !matches!(
            self.state,
            SittingState::SelectingTopic | SittingState::AllComplete
        ) {
            return Err(self.invalid("start a topic"));
        }
        match selection {
            TopicSelection::Single(topic) if !self.order.contains(topic) => {
                Err(SittingError::UnknownTopic(topic.clone()))
            }
            TopicSelection::Single(topic) if self.completed.contains(topic) => {
                Err(SittingError::TopicAlreadyCompleted(topic.clone()))
            }
            TopicSelection::Combined if self.completed.covers(&self.order) => {
                Err(self.invalid("start combined mode with every topic complete"))
            }
            _ => Ok(()),
        }
    }

    /// Enter `selection` once its content has been resolved.
    ///
    /// # Errors
    ///
    /// Returns `ContentUnavailable` when `question_count` is zero (state is
    /// left untouched) or any error from [`Self::can_start`].
    pub fn start(
        &mut self,
        selection: TopicSelection,
        question_count: usize,
    ) -> Result<(), SittingError> {
        self.can_start(&selection)?;
        if question_count == 0 {
            return Err(SittingError::ContentUnavailable { selection });
        }
        self.enter(selection, question_count);
        Ok(())
    }

    fn enter(&mut self, selection: TopicSelection, question_count: usize) {
        self.state = SittingState::InTopic(selection);
        self.question_index = 0;
        self.question_count = question_count;
    }

    /// Complete `selection`. Completing an already-completed topic is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `selection` is not the current topic.
    pub fn complete(&mut self, selection: &TopicSelection) -> Result<Completion, SittingError> {
        if self.is_completed(selection) {
            return Ok(Completion::AlreadyCompleted);
        }
        if self.current_selection() != Some(selection) {
            return Err(self.invalid("complete a topic that is not open"));
        }

        let topic = match selection {
            TopicSelection::Combined => {
                for topic in self.order.topics() {
                    self.completed.insert(topic.clone());
                }
                self.state = SittingState::AllComplete;
                return Ok(Completion::AllComplete);
            }
            TopicSelection::Single(topic) => topic,
        };

        self.completed.insert(topic.clone());
        self.question_index = 0;
        self.question_count = 0;

        if self.order.is_last(topic) {
            self.state = SittingState::AllComplete;
            return Ok(Completion::AllComplete);
        }
        match self.order.next_uncompleted_after(topic, &self.completed) {
            Some(next) => {
                let next = next.clone();
                self.state = SittingState::InTopic(TopicSelection::Single(next.clone()));
                Ok(Completion::Advanced(next))
            }
            None if self.completed.covers(&self.order) => {
                self.state = SittingState::AllComplete;
                Ok(Completion::AllComplete)
            }
            None => {
                self.state = SittingState::SelectingTopic;
                Ok(Completion::BackToSelection)
            }
        }
    }

    /// Record how many questions the auto-advanced topic has.
    pub fn set_question_count(&mut self, question_count: usize) {
        self.question_count = question_count;
        self.question_index = 0;
    }

    /// Leave the current topic without completing it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when no topic is open.
    pub fn return_to_selection(&mut self) -> Result<(), SittingError> {
        if self.current_selection().is_none() {
            return Err(self.invalid("leave a topic"));
        }
        self.state = SittingState::SelectingTopic;
        self.question_index = 0;
        self.question_count = 0;
        Ok(())
    }

    /// Move the cursor to another question of the open topic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` when no topic is open and
    /// `QuestionIndexOutOfRange` past the last question.
    pub fn move_to_question(&mut self, index: usize) -> Result<usize, SittingError> {
        if self.current_selection().is_none() {
            return Err(self.invalid("move between questions"));
        }
        if index >= self.question_count {
            return Err(SittingError::QuestionIndexOutOfRange {
                index,
                count: self.question_count,
            });
        }
        self.question_index = index;
        Ok(index)
    }

    /// Gate for the user's final confirmation.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` outside topic selection or before any topic
    /// is completed, and `ConfirmationRequired` when topics remain open and the
    /// caller has not acknowledged it.
    pub fn check_confirm_final(&self, acknowledge_incomplete: bool) -> Result<(), SittingError> {
        if !matches!(
            self.state,
            SittingState::SelectingTopic | SittingState::AllComplete
        ) {
            return Err(self.invalid("confirm the final submission"));
        }
        if self.completed.is_empty() {
            return Err(self.invalid("confirm the final submission before completing a topic"));
        }
        let remaining: Vec<Topic> = self
            .completed
            .remaining(&self.order)
            .into_iter()
            .cloned()
            .collect();
        if !remaining.is_empty() && !acknowledge_incomplete {
            return Err(SittingError::ConfirmationRequired { remaining });
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self) {
        self.state = SittingState::Submitted;
        self.question_index = 0;
        self.question_count = 0;
    }

    /// Back to a clean topic selection, after an administrator reset.
    pub fn reset(&mut self) {
        self.state = SittingState::SelectingTopic;
        self.completed.clear();
        self.question_index = 0;
        self.question_count = 0;
    }

    fn invalid(&self, action: &'static str) -> SittingError {
        SittingError::InvalidTransition {
            action,
            state: self.state.to_string(),
        }
    }
}

//
// ─── TESTS ─────────────────────────────────────────────────────────────────────
//
