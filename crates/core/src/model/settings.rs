use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::topic::{TopicError, TopicOrder};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    #[error("tick interval must be between 100ms and 60s")]
    InvalidTickInterval,

    #[error("retry attempts must be between 1 and 20")]
    InvalidRetryAttempts,

    #[error("retry base delay must be > 0 and <= max delay")]
    InvalidRetryDelays,

    #[error("watch poll interval must be between 50ms and 60s")]
    InvalidPollInterval,

    #[error(transparent)]
    TopicOrder(#[from] TopicError),
}

/// Runtime knobs of the examination engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    tick_interval: Duration,
    retry_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    watch_poll_interval: Duration,
    topic_order: TopicOrder,
}

/// Unvalidated settings, as read from a config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettingsDraft {
    pub tick_interval_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub watch_poll_interval_ms: Option<u64>,
    pub topic_order: Option<Vec<String>>,
}

impl EngineSettingsDraft {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in defaults and validate ranges.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError` for out-of-range values or a malformed topic order.
    pub fn validate(self) -> Result<EngineSettings, SettingsError> {
        let defaults = EngineSettings::default();

        let tick_interval = self
            .tick_interval_ms
            .map_or(defaults.tick_interval, Duration::from_millis);
        if tick_interval < Duration::from_millis(100) || tick_interval > Duration::from_secs(60) {
            return Err(SettingsError::InvalidTickInterval);
        }

        let retry_attempts = self.retry_attempts.unwrap_or(defaults.retry_attempts);
        if !(1..=20).contains(&retry_attempts) {
            return Err(SettingsError::InvalidRetryAttempts);
        }

        let retry_base_delay = self
            .retry_base_delay_ms
            .map_or(defaults.retry_base_delay, Duration::from_millis);
        let retry_max_delay = self
            .retry_max_delay_ms
            .map_or(defaults.retry_max_delay, Duration::from_millis);
        if retry_base_delay.is_zero() || retry_base_delay > retry_max_delay {
            return Err(SettingsError::InvalidRetryDelays);
        }

        let watch_poll_interval = self
            .watch_poll_interval_ms
            .map_or(defaults.watch_poll_interval, Duration::from_millis);
        if watch_poll_interval < Duration::from_millis(50)
            || watch_poll_interval > Duration::from_secs(60)
        {
            return Err(SettingsError::InvalidPollInterval);
        }

        let topic_order = match self.topic_order {
            Some(names) => TopicOrder::from_names(names)?,
            None => defaults.topic_order,
        };

        Ok(EngineSettings {
            tick_interval,
            retry_attempts,
            retry_base_delay,
            retry_max_delay,
            watch_poll_interval,
            topic_order,
        })
    }
}

impl EngineSettings {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    #[must_use]
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }

    #[must_use]
    pub fn retry_max_delay(&self) -> Duration {
        self.retry_max_delay
    }

    #[must_use]
    pub fn watch_poll_interval(&self) -> Duration {
        self.watch_poll_interval
    }

    #[must_use]
    pub fn topic_order(&self) -> &TopicOrder {
        &self.topic_order
    }

    #[must_use]
    pub fn with_topic_order(mut self, order: TopicOrder) -> Self {
        self.topic_order = order;
        self
    }

    /// Shrinks retry delays to a millisecond, for tests that exercise retries.
    #[must_use]
    pub fn with_fast_retries(mut self) -> Self {
        self.retry_base_delay = Duration::from_millis(1);
        self.retry_max_delay = Duration::from_millis(1);
        self
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
            watch_poll_interval: Duration::from_millis(500),
            topic_order: TopicOrder::office_default(),
        }
    }
}
