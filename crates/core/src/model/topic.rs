use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TopicError {
    #[error("topic name cannot be empty")]
    EmptyName,

    #[error("topic name may only contain letters, digits, '-' or '_': {0}")]
    InvalidName(String),

    #[error("topic order cannot be empty")]
    EmptyOrder,

    #[error("topic appears more than once in order: {0}")]
    DuplicateTopic(Topic),
}

//
// ─── TOPIC ─────────────────────────────────────────────────────────────────────
//

/// A named scoring section of an exam, normalized to upper case.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Validate and normalize a topic name.
    ///
    /// # Errors
    ///
    /// Returns `TopicError::EmptyName` for blank input and
    /// `TopicError::InvalidName` for names with unsupported characters.
    pub fn new(name: impl AsRef<str>) -> Result<Self, TopicError> {
        let trimmed = name.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TopicError::EmptyName);
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(TopicError::InvalidName(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Topic {
    type Error = TopicError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

//
// ─── ORDER ─────────────────────────────────────────────────────────────────────
//

/// Fixed total order in which topics are taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOrder {
    topics: Vec<Topic>,
}

impl TopicOrder {
    /// Build an order from a list of topics.
    ///
    /// # Errors
    ///
    /// Returns `TopicError::EmptyOrder` when no topics are given and
    /// `TopicError::DuplicateTopic` when a topic is repeated.
    pub fn new(topics: Vec<Topic>) -> Result<Self, TopicError> {
        if topics.is_empty() {
            return Err(TopicError::EmptyOrder);
        }
        let mut seen = BTreeSet::new();
        for topic in &topics {
            if !seen.insert(topic) {
                return Err(TopicError::DuplicateTopic(topic.clone()));
            }
        }
        Ok(Self { topics })
    }

    /// Parse an order from raw names.
    ///
    /// # Errors
    ///
    /// Returns `TopicError` if any name is invalid or the order is malformed.
    pub fn from_names<I, S>(names: I) -> Result<Self, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics = names
            .into_iter()
            .map(Topic::new)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(topics)
    }

    /// The five-section office skills order, ending in the practical section.
    #[must_use]
    pub fn office_default() -> Self {
        let topics = ["EXCEL", "WORD", "PPT", "ARSIP", "PRAKTIKUM"]
            .into_iter()
            .map(|name| Topic(name.to_string()))
            .collect();
        Self { topics }
    }

    #[must_use]
    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    #[must_use]
    pub fn position(&self, topic: &Topic) -> Option<usize> {
        self.topics.iter().position(|t| t == topic)
    }

    #[must_use]
    pub fn first(&self) -> Option<&Topic> {
        self.topics.first()
    }

    #[must_use]
    pub fn is_last(&self, topic: &Topic) -> bool {
        self.topics.last() == Some(topic)
    }

    /// First topic after `topic` in order that is not yet in `completed`.
    ///
    /// Never wraps around to earlier topics.
    #[must_use]
    pub fn next_uncompleted_after(&self, topic: &Topic, completed: &TopicProgress) -> Option<&Topic> {
        let start = self.position(topic)? + 1;
        self.topics[start..]
            .iter()
            .find(|candidate| !completed.contains(candidate))
    }
}

impl Default for TopicOrder {
    fn default() -> Self {
        Self::office_default()
    }
}

/// Which questions a sitting stage covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopicSelection {
    Single(Topic),
    /// Every topic's questions in one stage, without per-topic auto-advance.
    Combined,
}

impl fmt::Display for TopicSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelection::Single(topic) => write!(f, "{topic}"),
            TopicSelection::Combined => f.write_str("COMBINED"),
        }
    }
}

//
// ─── PROGRESS ──────────────────────────────────────────────────────────────────
//

/// Set of topics a student has completed during the current sitting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicProgress {
    completed: BTreeSet<Topic>,
}

impl TopicProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a topic completed. Returns `false` if it already was.
    pub fn insert(&mut self, topic: Topic) -> bool {
        self.completed.insert(topic)
    }

    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.completed.contains(topic)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.completed.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Topic> {
        self.completed.iter()
    }

    /// True when every topic in `order` is completed.
    #[must_use]
    pub fn covers(&self, order: &TopicOrder) -> bool {
        order.topics().iter().all(|t| self.contains(t))
    }

    /// Topics in `order` that are still open, in order.
    #[must_use]
    pub fn remaining<'a>(&self, order: &'a TopicOrder) -> Vec<&'a Topic> {
        order
            .topics()
            .iter()
            .filter(|t| !self.contains(t))
            .collect()
    }

    /// Only used when an administrator reset is observed.
    pub fn clear(&mut self) {
        self.completed.clear();
    }
}

impl FromIterator<Topic> for TopicProgress {
    fn from_iter<T: IntoIterator<Item = Topic>>(iter: T) -> Self {
        Self {
            completed: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    #[test]
    fn topic_names_are_normalized() {
        assert_eq!(topic("  excel ").as_str(), "EXCEL");
        assert!(matches!(Topic::new(" "), Err(TopicError::EmptyName)));
        assert!(matches!(
            Topic::new("word processing"),
            Err(TopicError::InvalidName(_))
        ));
    }

    #[test]
    fn order_rejects_duplicates() {
        let err = TopicOrder::from_names(["EXCEL", "excel"]).unwrap_err();
        assert_eq!(err, TopicError::DuplicateTopic(topic("EXCEL")));
        assert_eq!(
            TopicOrder::from_names(Vec::<String>::new()).unwrap_err(),
            TopicError::EmptyOrder
        );
    }

    #[test]
    fn next_uncompleted_skips_done_topics_without_wrapping() {
        let order = TopicOrder::office_default();
        let mut progress = TopicProgress::new();
        progress.insert(topic("WORD"));

        assert_eq!(
            order.next_uncompleted_after(&topic("EXCEL"), &progress),
            Some(&topic("PPT"))
        );
        assert_eq!(order.next_uncompleted_after(&topic("PRAKTIKUM"), &progress), None);
    }

    #[test]
    fn progress_insert_is_idempotent() {
        let mut progress = TopicProgress::new();
        assert!(progress.insert(topic("EXCEL")));
        assert!(!progress.insert(topic("EXCEL")));
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn progress_round_trips_as_plain_list() {
        let progress: TopicProgress = [topic("WORD"), topic("EXCEL")].into_iter().collect();
        let json = serde_json::to_string(&progress).unwrap();
        assert_eq!(json, r#"["EXCEL","WORD"]"#);
        let back: TopicProgress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, progress);
    }

    #[test]
    fn remaining_lists_open_topics_in_order() {
        let order = TopicOrder::office_default();
        let progress: TopicProgress = [topic("EXCEL"), topic("PPT")].into_iter().collect();
        let remaining: Vec<&str> = progress.remaining(&order).iter().map(|t| t.as_str()).collect();
        assert_eq!(remaining, vec!["WORD", "ARSIP", "PRAKTIKUM"]);
        assert!(!progress.covers(&order));
    }
}
