//! Reconnect backoff and retry budget.
//!
//! - [`ReconnectPolicy`]: how many reconnect attempts, and how long to
//!   sleep between them
//! - [`RetryBudget`]: the attempt counter a supervisor spends from
//!
//! # Backoff Schedule
//!
//! Attempt `n` (0-indexed) that fails is followed by a sleep of
//! `base_delay << n`, capped at `max_delay`. The last attempt is not
//! followed by a sleep; the supervisor gives up immediately.
//!
//! ```text
//! base = 1s, max_retries = 5
//!
//! Attempt  Sleep after failure
//! -------  -------------------
//! 0        1s
//! 1        2s
//! 2        4s
//! 3        8s
//! 4        (give up)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up. Zero means never reconnect.
    pub max_retries: u32,

    /// Sleep after the first failed attempt.
    pub base_delay: Duration,

    /// Ceiling for the exponential schedule.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl ReconnectPolicy {
    /// Long-running capture: keep trying for a long time, capped at 5 minutes.
    ///
    /// ```text
    /// 1s 2s 4s 8s ... 256s 300s 300s ...
    /// ```
    pub fn daemon() -> Self {
        Self {
            max_retries: 64,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    /// Sleep after failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Sum of every sleep the supervisor would take before giving up.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries.saturating_sub(1))
            .map(|n| self.delay_for_attempt(n))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}

/// Attempt counter for one client.
///
/// Reset to zero only after a reconnect has fully succeeded (session open
/// and streaming resubscribed).
#[derive(Debug)]
pub struct RetryBudget {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
}

impl RetryBudget {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts spent since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Spend one attempt. Returns the 0-indexed attempt number, or `None`
    /// once the budget is exhausted.
    pub fn try_spend(&self) -> Option<u32> {
        let max = self.policy.max_retries;
        self.attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts() >= self.policy.max_retries
    }

    /// Whether another attempt follows attempt `attempt`.
    pub fn has_remaining_after(&self, attempt: u32) -> bool {
        attempt + 1 < self.policy.max_retries
    }

    pub fn reset(&self) {
        self.attempts.store(0, Ordering::Release);
    }
}
