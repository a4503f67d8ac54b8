//! Upload retry policy

use std::time::Duration;

use crate::models::PendingChange;

/// Attempt budget and exponential backoff for failed uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures after which a change stops auto-retrying
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Policy without waiting between attempts.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before the next attempt after `failures` consecutive failures.
    ///
    /// `base * 2^(failures - 1)`, capped at `max_delay`.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether a change with this many failures has stopped auto-retrying.
    pub const fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    /// Whether a change may be attempted at `now` (Unix ms).
    pub fn is_ready(&self, change: &PendingChange, now: i64) -> bool {
        if self.is_exhausted(change.retry_count) {
            return false;
        }
        let Some(last_attempt) = change.last_attempt_at else {
            return true;
        };
        let wait = i64::try_from(self.backoff(change.retry_count).as_millis()).unwrap_or(i64::MAX);
        now >= last_attempt.saturating_add(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOperation, Payload};

    fn change(retry_count: u32, last_attempt_at: Option<i64>) -> PendingChange {
        PendingChange {
            id: 1,
            table_name: "boats".to_string(),
            record_id: "b1".to_string(),
            operation: ChangeOperation::Update,
            payload: Payload::new(),
            created_at: 0,
            retry_count,
            last_error: None,
            base_version: None,
            last_attempt_at,
            sent_at: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
        assert_eq!(policy.backoff(40), Duration::from_secs(5));
    }

    #[test]
    fn exhaustion_uses_threshold() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn readiness_respects_backoff_window() {
        let policy = RetryPolicy::default();
        assert!(policy.is_ready(&change(0, None), 0));
        assert!(!policy.is_ready(&change(1, Some(1_000)), 5_999));
        assert!(policy.is_ready(&change(1, Some(1_000)), 6_000));
        assert!(!policy.is_ready(&change(3, None), 1_000_000));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert!(policy.is_ready(&change(2, Some(1_000)), 1_000));
    }
}
