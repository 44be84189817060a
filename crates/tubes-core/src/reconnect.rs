use std::time::Duration;

use serde::Deserialize;

/// How many times an endpoint connect is attempted, and how long to wait
/// between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Total attempts per connect, including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled on each further attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that tries exactly once
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after `failed` attempts have failed (`failed >= 1`)
    pub fn backoff(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(16);
        let mul = 1u64.checked_shl(shift).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(mul)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
