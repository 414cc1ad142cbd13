//! Bounded exponential backoff for store writes.

use std::future::Future;
use std::time::Duration;

use exam_core::model::EngineSettings;
use rand::Rng;
use storage::repository::StorageError;

/// How many times, and how patiently, a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.retry_attempts(),
            settings.retry_base_delay(),
            settings.retry_max_delay(),
        )
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1_u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(0);
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default())
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt hit a transient failure.
    Exhausted { attempts: u32, last: StorageError },
    /// A non-transient failure; not retried.
    Permanent(StorageError),
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(RetryError::Permanent(err)),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(operation = what, attempts = attempt, error = %err, "giving up");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.jittered(attempt);
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
