//! When a crashed instance may be placed again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lodestar_core::clock::after;

/// Restart schedule for crashed instances.
///
/// The first `immediate_restarts` crashes restart right away. After that an
/// instance waits `base_backoff * 2^(crash_count - immediate_restarts)`,
/// capped at `max_backoff`, measured from the crash. Once `crash_count`
/// reaches `max_restart_attempts` the instance stays crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashRestartPolicy {
    /// Crashes that restart without waiting.
    pub immediate_restarts: u32,
    /// Wait after the first delayed crash.
    #[serde(with = "crate::config::duration_secs")]
    pub base_backoff: Duration,
    /// Upper bound on the wait.
    #[serde(with = "crate::config::duration_secs")]
    pub max_backoff: Duration,
    /// Crash count at which restarts stop.
    pub max_restart_attempts: u32,
}

impl Default for CrashRestartPolicy {
    fn default() -> Self {
        Self {
            immediate_restarts: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(16 * 60),
            max_restart_attempts: 200,
        }
    }
}

/// What to do with one crashed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashDecision {
    /// Reset it and ask for placement now.
    Restart,
    /// Leave it until the given time.
    WaitUntil(DateTime<Utc>),
    /// Leave it crashed for good.
    GiveUp,
}

impl CrashRestartPolicy {
    /// Returns the wait before restart number `crash_count`.
    #[must_use]
    pub fn backoff(&self, crash_count: u32) -> Duration {
        if crash_count <= self.immediate_restarts {
            return Duration::ZERO;
        }
        let doublings = crash_count - self.immediate_restarts;
        2_u32
            .checked_pow(doublings)
            .and_then(|factor| self.base_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |wait| wait.min(self.max_backoff))
    }

    /// Decides for an instance that crashed `crash_count` times, last at
    /// `crashed_at`.
    #[must_use]
    pub fn decide(
        &self,
        crash_count: u32,
        crashed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CrashDecision {
        if crash_count >= self.max_restart_attempts {
            return CrashDecision::GiveUp;
        }
        let restart_at = after(crashed_at, self.backoff(crash_count));
        if restart_at <= now {
            CrashDecision::Restart
        } else {
            CrashDecision::WaitUntil(restart_at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn early_crashes_restart_immediately() {
        let policy = CrashRestartPolicy::default();
        let now = Utc::now();
        for crash_count in 1..=3 {
            assert_eq!(policy.decide(crash_count, now, now), CrashDecision::Restart);
        }
    }

    #[test]
    fn later_crashes_back_off_exponentially() {
        let policy = CrashRestartPolicy::default();
        assert_eq!(policy.backoff(4), Duration::from_secs(60));
        assert_eq!(policy.backoff(5), Duration::from_secs(120));
        assert_eq!(policy.backoff(8), Duration::from_secs(960));
        assert_eq!(policy.backoff(9), Duration::from_secs(960));
        assert_eq!(policy.backoff(150), Duration::from_secs(960));

        let now = Utc::now();
        let crashed_at = now - chrono::Duration::seconds(30);
        assert!(matches!(
            policy.decide(4, crashed_at, now),
            CrashDecision::WaitUntil(_)
        ));
        assert_eq!(
            policy.decide(4, now - chrono::Duration::seconds(60), now),
            CrashDecision::Restart
        );
    }

    #[test]
    fn exhausted_budget_gives_up() {
        let policy = CrashRestartPolicy::default();
        let long_ago = Utc::now() - chrono::Duration::days(1);
        assert_eq!(
            policy.decide(200, long_ago, Utc::now()),
            CrashDecision::GiveUp
        );
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_the_cap(crash_count in 0u32..10_000) {
            let policy = CrashRestartPolicy::default();
            prop_assert!(policy.backoff(crash_count) <= policy.max_backoff);
        }

        #[test]
        fn backoff_is_monotonic(crash_count in 0u32..1_000) {
            let policy = CrashRestartPolicy::default();
            prop_assert!(policy.backoff(crash_count) <= policy.backoff(crash_count + 1));
        }
    }
}
