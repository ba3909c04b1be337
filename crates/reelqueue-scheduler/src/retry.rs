//! Linear retry backoff.

use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Give up.
    Terminal,
}

/// Decide the fate of a job whose attempt number `attempt` just failed.
///
/// `attempt` is the count after incrementing. Attempts up to and including
/// `max_retries` are retried after `attempt * base`; anything past that is
/// terminal.
pub fn decide(attempt: u32, max_retries: u32, base: Duration) -> RetryDecision {
    if attempt == 0 || attempt > max_retries {
        return RetryDecision::Terminal;
    }
    RetryDecision::Retry(base.saturating_mul(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MINUTE: Duration = Duration::from_secs(60);

    // === Unit Tests ===

    #[test]
    fn test_linear_delays() {
        assert_eq!(decide(1, 3, MINUTE), RetryDecision::Retry(MINUTE));
        assert_eq!(decide(2, 3, MINUTE), RetryDecision::Retry(MINUTE * 2));
        assert_eq!(decide(3, 3, MINUTE), RetryDecision::Retry(MINUTE * 3));
    }

    #[test]
    fn test_terminal_past_budget() {
        assert_eq!(decide(4, 3, MINUTE), RetryDecision::Terminal);
        assert_eq!(decide(u32::MAX, 3, MINUTE), RetryDecision::Terminal);
    }

    #[test]
    fn test_zero_budget_is_always_terminal() {
        assert_eq!(decide(1, 0, MINUTE), RetryDecision::Terminal);
    }

    #[test]
    fn test_zero_attempt_is_terminal() {
        // An attempt count of zero means nothing ran, which is not retryable
        assert_eq!(decide(0, 3, MINUTE), RetryDecision::Terminal);
    }

    #[test]
    fn test_zero_base_retries_immediately() {
        assert_eq!(decide(2, 3, Duration::ZERO), RetryDecision::Retry(Duration::ZERO));
    }

    // === Property-Based Tests ===

    proptest! {
        // Exactly max_retries attempts are retried
        #[test]
        fn retries_exactly_budget(max in 0u32..50, base_ms in 0u64..120_000) {
            let base = Duration::from_millis(base_ms);
            let retried = (1..=max + 5)
                .filter(|a| matches!(decide(*a, max, base), RetryDecision::Retry(_)))
                .count();
            prop_assert_eq!(retried, max as usize);
        }

        // Delays grow with the attempt number
        #[test]
        fn delays_non_decreasing(max in 1u32..50, base_ms in 0u64..120_000) {
            let base = Duration::from_millis(base_ms);
            let delays: Vec<Duration> = (1..=max)
                .filter_map(|a| match decide(a, max, base) {
                    RetryDecision::Retry(d) => Some(d),
                    RetryDecision::Terminal => None,
                })
                .collect();
            prop_assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        }

        // Once terminal, every later attempt is terminal too
        #[test]
        fn terminal_is_absorbing(max in 0u32..50, attempt in 1u32..100) {
            if decide(attempt, max, MINUTE) == RetryDecision::Terminal {
                prop_assert_eq!(decide(attempt + 1, max, MINUTE), RetryDecision::Terminal);
            }
        }
    }
}
