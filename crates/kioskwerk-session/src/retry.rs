// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Backoff schedules shared by cleanup retries and escalation recovery.
//
// Attempts are counted from zero. Delays are deterministic; there is a single
// agent per kiosk, so there is no herd to spread out.

use std::time::Duration;

use kioskwerk_core::config::{BackoffStrategy, CleanupConfig, EscalationConfig};
use tracing::{debug, warn};

/// Ceiling for any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(15 * 60);

/// A backoff schedule.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub base: Duration,
    pub max_attempts: u32,
}

/// Result of asking whether another attempt is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    RetryAfter(Duration),
    /// Maximum attempts used.
    Exhausted,
}

impl Backoff {
    pub fn exponential(base: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// linear: `base * (attempt + 1)`; exponential: `base * 2^attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = match self.strategy {
            BackoffStrategy::Linear => attempt.saturating_add(1),
            BackoffStrategy::Exponential => 1u32 << attempt.min(16),
        };
        self.base.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Decide whether `attempt` (zero-based, already failed) may be followed
    /// by another.
    pub fn next(&self, attempt: u32) -> RetryDecision {
        if attempt + 1 >= self.max_attempts {
            warn!(attempt, max = self.max_attempts, "retry limit exhausted");
            RetryDecision::Exhausted
        } else {
            let delay = self.delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling retry");
            RetryDecision::RetryAfter(delay)
        }
    }
}

impl From<&CleanupConfig> for Backoff {
    fn from(config: &CleanupConfig) -> Self {
        Self {
            strategy: config.backoff,
            base: config.retry_delay(),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl From<&EscalationConfig> for Backoff {
    fn from(config: &EscalationConfig) -> Self {
        Self::exponential(config.retry_base_delay(), config.max_retry_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles() {
        let b = Backoff::exponential(Duration::from_secs(1), 5);
        assert_eq!(b.delay(0), Duration::from_secs(1));
        assert_eq!(b.delay(1), Duration::from_secs(2));
        assert_eq!(b.delay(3), Duration::from_secs(8));
    }

    #[test]
    fn linear_grows_by_base() {
        let b = Backoff {
            strategy: BackoffStrategy::Linear,
            base: Duration::from_millis(500),
            max_attempts: 3,
        };
        assert_eq!(b.delay(0), Duration::from_millis(500));
        assert_eq!(b.delay(2), Duration::from_millis(1500));
    }

    #[test]
    fn delay_capped() {
        let b = Backoff::exponential(Duration::from_secs(60), 40);
        assert_eq!(b.delay(30), MAX_DELAY);
    }

    #[test]
    fn next_respects_max_attempts() {
        let b = Backoff::exponential(Duration::from_secs(1), 3);
        assert_eq!(b.next(0), RetryDecision::RetryAfter(Duration::from_secs(1)));
        assert_eq!(b.next(1), RetryDecision::RetryAfter(Duration::from_secs(2)));
        assert_eq!(b.next(2), RetryDecision::Exhausted);
    }

    #[test]
    fn cleanup_config_never_yields_zero_attempts() {
        let config = CleanupConfig {
            max_attempts: 0,
            ..CleanupConfig::default()
        };
        assert_eq!(Backoff::from(&config).max_attempts, 1);
    }
}
