//! Retry policy
//!
//! Re-runs the per-case sequence after a failed attempt. Fixture-level hooks
//! are never part of a retry.

use std::time::Duration;

use crate::config::{Backoff, RetryConfig};
use crate::models::Outcome;

/// Per-case retry declarations; unset fields fall back to the config
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryOverride {
    pub retries: Option<u32>,
    pub delay_ms: Option<u64>,
    pub backoff: Option<Backoff>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
            backoff: Backoff::Constant,
        }
    }

    /// Per-case declarations win over the global settings, field by field
    pub fn resolve(config: &RetryConfig, case: RetryOverride) -> Self {
        Self {
            max_retries: case.retries.unwrap_or(config.max_retries),
            delay: Duration::from_millis(case.delay_ms.unwrap_or(config.delay_ms)),
            backoff: case.backoff.unwrap_or(config.backoff),
        }
    }

    /// Total attempts allowed, including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt follows `attempt` (1-based) ending in `outcome`
    pub fn should_retry(&self, attempt: u32, outcome: Outcome) -> bool {
        outcome == Outcome::Failed && attempt < self.max_attempts()
    }

    /// Pause before the attempt that follows `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retries(n: u32) -> RetryOverride {
        RetryOverride {
            retries: Some(n),
            ..Default::default()
        }
    }

    #[test]
    fn test_retry_three_means_four_attempts() {
        let policy = RetryPolicy::resolve(&RetryConfig::default(), retries(3));
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.should_retry(3, Outcome::Failed));
        assert!(!policy.should_retry(4, Outcome::Failed));
    }

    #[test]
    fn test_only_failed_attempts_retry() {
        let policy = RetryPolicy::resolve(&RetryConfig::default(), retries(2));
        assert!(!policy.should_retry(1, Outcome::Passed));
        assert!(!policy.should_retry(1, Outcome::Inconclusive));
        assert!(!policy.should_retry(1, Outcome::TimedOut));
    }

    #[test]
    fn test_case_override_beats_config() {
        let config = RetryConfig {
            max_retries: 5,
            delay_ms: 0,
            backoff: Backoff::Constant,
        };
        assert_eq!(RetryPolicy::resolve(&config, retries(0)).max_attempts(), 1);
        assert_eq!(
            RetryPolicy::resolve(&config, RetryOverride::default()).max_attempts(),
            6
        );
    }

    #[test]
    fn test_case_delay_and_backoff_beat_config() {
        let config = RetryConfig {
            max_retries: 2,
            delay_ms: 500,
            backoff: Backoff::Constant,
        };
        let policy = RetryPolicy::resolve(
            &config,
            RetryOverride {
                retries: None,
                delay_ms: Some(5),
                backoff: Some(Backoff::Exponential),
            },
        );
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_after(1), Duration::from_millis(5));
        assert_eq!(policy.delay_after(3), Duration::from_millis(20));

        let partial = RetryPolicy::resolve(
            &config,
            RetryOverride {
                delay_ms: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(partial.delay, Duration::ZERO);
        assert_eq!(partial.backoff, Backoff::Constant);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_retries: 4,
            delay: Duration::from_millis(10),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
    }
}
