//! Reconnection policy for failed broadcasts.
//!
//! Classification says what happened; this module decides what to do about
//! it. Only connection-class failures are retried, with exponential backoff
//! and a bounded attempt budget. The orchestration loop owns the actual
//! waiting so a user stop can pre-empt any pending delay.

use crate::classify::FailureKind;
use std::time::Duration;

/// Base delay unit for the backoff schedule.
const BACKOFF_BASE_SECS: u64 = 1;

/// Upper bound on a single backoff delay.
const BACKOFF_CAP_SECS: u64 = 60;

/// Decision for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the given delay, then attempt again.
    Retry { delay: Duration },
    /// Do not retry; surface the failure.
    GiveUp,
}

/// Per-broadcast retry state. Lives from one Start call to terminal
/// success or exhaustion; a user stop abandons it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Completed reconnect waits so far.
    pub attempts: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Delays actually waited, for diagnostics.
    pub backoff_log: Vec<Duration>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            backoff_log: Vec::new(),
        }
    }

    /// Decides what to do about a classified failure.
    ///
    /// Retries only connection failures, and only while the attempt budget
    /// lasts. Everything else gives up immediately.
    pub fn decide(&self, kind: FailureKind) -> RetryDecision {
        if kind != FailureKind::Connection {
            return RetryDecision::GiveUp;
        }

        if self.attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            delay: backoff_delay(self.attempts),
        }
    }

    /// Records a completed wait. Attempts increment after each wait,
    /// independent of the delay value.
    pub fn record_wait(&mut self, delay: Duration) {
        self.attempts += 1;
        self.backoff_log.push(delay);
    }

    /// True once the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Backoff delay for the given completed-attempt count:
/// `min(2^attempts * 1s, 60s)`.
pub fn backoff_delay(attempts: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempts).saturating_mul(BACKOFF_BASE_SECS);
    Duration::from_secs(exp.min(BACKOFF_CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // *For any* attempt count, the delay is exponential below the cap and
    // never exceeds it.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_backoff_bounded_by_cap(attempts in 0u32..1000) {
            let delay = backoff_delay(attempts);
            prop_assert!(delay <= Duration::from_secs(BACKOFF_CAP_SECS));
            prop_assert!(delay >= Duration::from_secs(BACKOFF_BASE_SECS));
        }

        #[test]
        fn prop_backoff_monotonic(attempts in 0u32..16) {
            prop_assert!(backoff_delay(attempts) <= backoff_delay(attempts + 1));
        }

        // Non-connection failures never retry, regardless of budget left.
        #[test]
        fn prop_only_connection_failures_retry(
            attempts in 0u32..8,
            max_attempts in 1u32..8,
            kind in prop::sample::select(vec![
                FailureKind::UserStop,
                FailureKind::Crash,
                FailureKind::FatalConfig,
                FailureKind::MemoryPressure,
                FailureKind::Unclassified,
            ]),
        ) {
            let state = RetryState {
                attempts,
                max_attempts,
                backoff_log: Vec::new(),
            };
            prop_assert_eq!(state.decide(kind), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60)); // capped
        assert_eq!(backoff_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn test_connection_failures_retry_until_budget_spent() {
        let mut state = RetryState::new(4);

        for expected_delay in [1u64, 2, 4, 8] {
            match state.decide(FailureKind::Connection) {
                RetryDecision::Retry { delay } => {
                    assert_eq!(delay, Duration::from_secs(expected_delay));
                    state.record_wait(delay);
                }
                RetryDecision::GiveUp => panic!("budget should not be spent yet"),
            }
        }

        assert!(state.exhausted());
        assert_eq!(state.decide(FailureKind::Connection), RetryDecision::GiveUp);
        assert_eq!(state.backoff_log.len(), 4);
    }

    #[test]
    fn test_zero_budget_never_retries() {
        let state = RetryState::new(0);
        assert_eq!(state.decide(FailureKind::Connection), RetryDecision::GiveUp);
    }
}
