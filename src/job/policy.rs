use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Stage retry behaviour for retryable gateway failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per stage, first try included.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Interval schedule between status queries while a recognition job is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSchedule {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl PollSchedule {
    /// Wait after the `pending_count`-th consecutive `Pending` (0-based):
    /// initial, 2x, 4x, ... capped at `max_ms`.
    pub fn interval(&self, pending_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(pending_count.min(32));
        let ms = self.initial_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }
}
