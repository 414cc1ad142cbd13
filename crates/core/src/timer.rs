//! Deadline arithmetic for timed sittings.
//!
//! Remaining time is always derived from the authoritative `end_time` and the
//! current instant. Nothing here counts down, so a client that was suspended
//! for a while reads the correct value on its next tick.

use chrono::{DateTime, Utc};

/// Whole seconds left until `end_time`, rounded up and floored at zero.
#[must_use]
pub fn remaining_seconds(end_time: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (end_time - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    let millis = u64::try_from(millis).unwrap_or(u64::MAX);
    millis.div_ceil(1000)
}

/// Result of a single countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Running { remaining_seconds: u64 },
    /// Raised exactly once, on the first tick at or past the deadline.
    Expired,
    /// The countdown has already expired or was stopped.
    Stopped,
}

/// Countdown towards an authoritative deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Countdown {
    end_time: DateTime<Utc>,
    finished: bool,
    stopped: bool,
}

impl Countdown {
    #[must_use]
    pub fn new(end_time: DateTime<Utc>) -> Self {
        Self {
            end_time,
            finished: false,
            stopped: false,
        }
    }

    #[must_use]
    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    /// Follow a deadline change from the authoritative store.
    ///
    /// An expired countdown re-arms when the new deadline is still ahead of
    /// `now`. A stopped countdown stays stopped.
    pub fn retarget(&mut self, end_time: DateTime<Utc>, now: DateTime<Utc>) {
        self.end_time = end_time;
        if self.finished && !self.stopped && remaining_seconds(end_time, now) > 0 {
            self.finished = false;
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        if self.finished {
            0
        } else {
            remaining_seconds(self.end_time, now)
        }
    }

    /// Recompute from absolute time.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Tick {
        if self.finished {
            return Tick::Stopped;
        }
        match remaining_seconds(self.end_time, now) {
            0 => {
                self.finished = true;
                Tick::Expired
            }
            remaining_seconds => Tick::Running { remaining_seconds },
        }
    }

    /// Stop without raising `Expired`, e.g. after a manual submission.
    pub fn stop(&mut self) {
        self.finished = true;
        self.stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration;

    #[test]
    fn remaining_rounds_partial_seconds_up() {
        let end = fixed_now() + Duration::milliseconds(1_001);
        assert_eq!(remaining_seconds(end, fixed_now()), 2);
        assert_eq!(remaining_seconds(end, fixed_now() + Duration::milliseconds(1)), 1);
    }

    #[test]
    fn remaining_is_floored_at_zero() {
        let end = fixed_now();
        assert_eq!(remaining_seconds(end, end), 0);
        assert_eq!(remaining_seconds(end, end + Duration::hours(5)), 0);
    }

    #[test]
    fn remaining_never_increases_as_time_moves_forward() {
        let end = fixed_now() + Duration::minutes(3);
        let mut previous = u64::MAX;
        for step in 0..400 {
            let now = fixed_now() + Duration::milliseconds(step * 487);
            let current = remaining_seconds(end, now);
            assert!(current <= previous, "step {step}: {current} > {previous}");
            previous = current;
        }
        assert_eq!(previous, 0);
    }

    #[test]
    fn countdown_expires_exactly_once() {
        let end = fixed_now() + Duration::seconds(2);
        let mut countdown = Countdown::new(end);

        assert_eq!(
            countdown.tick(fixed_now()),
            Tick::Running { remaining_seconds: 2 }
        );
        assert_eq!(countdown.tick(end + Duration::seconds(1)), Tick::Expired);
        assert_eq!(countdown.tick(end + Duration::seconds(2)), Tick::Stopped);
        assert_eq!(countdown.remaining_seconds(fixed_now()), 0);
    }

    #[test]
    fn countdown_self_corrects_after_suspension() {
        let end = fixed_now() + Duration::minutes(10);
        let mut countdown = Countdown::new(end);
        countdown.tick(fixed_now());

        // No ticks for eight minutes, then resume.
        let resumed = fixed_now() + Duration::minutes(8);
        assert_eq!(
            countdown.tick(resumed),
            Tick::Running { remaining_seconds: 120 }
        );
    }

    #[test]
    fn extended_deadline_rearms_an_expired_countdown() {
        let mut countdown = Countdown::new(fixed_now());
        assert_eq!(countdown.tick(fixed_now()), Tick::Expired);

        countdown.retarget(fixed_now() + Duration::minutes(5), fixed_now());
        assert!(!countdown.is_finished());
        assert_eq!(
            countdown.tick(fixed_now()),
            Tick::Running { remaining_seconds: 300 }
        );
        assert_eq!(countdown.remaining_seconds(fixed_now()), 300);
        assert_eq!(
            countdown.tick(fixed_now() + Duration::minutes(5)),
            Tick::Expired
        );
    }

    #[test]
    fn retarget_into_the_past_keeps_expiry() {
        let mut countdown = Countdown::new(fixed_now());
        countdown.tick(fixed_now());
        countdown.retarget(fixed_now() - Duration::seconds(1), fixed_now());
        assert!(countdown.is_finished());
        assert_eq!(countdown.tick(fixed_now()), Tick::Stopped);
    }

    #[test]
    fn retarget_does_not_restart_a_stopped_countdown() {
        let mut countdown = Countdown::new(fixed_now() + Duration::minutes(1));
        countdown.stop();
        countdown.retarget(fixed_now() + Duration::hours(1), fixed_now());
        assert_eq!(countdown.tick(fixed_now()), Tick::Stopped);
    }

    #[test]
    fn stopped_countdown_never_raises_expired() {
        let mut countdown = Countdown::new(fixed_now());
        countdown.stop();
        assert_eq!(countdown.tick(fixed_now() + Duration::hours(1)), Tick::Stopped);
    }
}
