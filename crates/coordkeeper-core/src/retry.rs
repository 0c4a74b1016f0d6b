//! Bounded-backoff, unbounded-tries retry policy for the coordination
//! client.
//!
//! spec.md §9: "the supervisor uses `max_tries = ∞` on purpose — do not
//! 'fix' this by surfacing exhaustion." `RetryPolicy::unbounded` is the only
//! policy `CoordinationClient` uses; the `max_tries` field exists so the
//! policy shape matches the one named in the spec, not so callers can
//! configure a bounded variant for production use.

use std::time::Duration;

/// An explicit retry policy object, as named in spec.md §9:
/// `{deadline, max_delay, max_tries}`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Per-attempt deadline before giving up on that attempt and retrying.
    pub deadline: Duration,
    /// Ceiling on the backoff delay between attempts.
    pub max_delay: Duration,
    /// Maximum number of attempts. `None` means retry forever.
    pub max_tries: Option<u32>,
}

impl RetryPolicy {
    /// The policy CoordinationClient uses for every mutating call: the
    /// supervisor prefers to block indefinitely over making an unsafe
    /// decision from a failed write.
    pub fn unbounded() -> Self {
        RetryPolicy {
            deadline: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            max_tries: None,
        }
    }

    /// Delay before the `attempt`-th retry (0-indexed), doubling each time
    /// up to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let millis = self.max_delay.as_millis().min(
            100u128.saturating_mul(1u128 << attempt.min(16)),
        );
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt is allowed after `attempt` has already run.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_tries {
            None => true,
            Some(max) => attempt < max,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_policy_never_exhausts() {
        let policy = RetryPolicy::unbounded();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1_000_000));
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let policy = RetryPolicy::unbounded();
        let capped = policy.delay_for_attempt(30);
        assert_eq!(capped, policy.max_delay);
    }

    #[test]
    fn delay_grows_with_attempt_before_cap() {
        let policy = RetryPolicy::unbounded();
        assert!(policy.delay_for_attempt(1) >= policy.delay_for_attempt(0));
    }
}
