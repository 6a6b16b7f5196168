use std::time::Duration;

use serde_json::Value;

/// Exponential backoff for retryable run failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retry.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Read `/retry/*`; absent keys keep their defaults.
    pub fn from_config_json(config: &Value) -> Self {
        let d = Self::default();
        let ms = |key: &str| config.pointer(key).and_then(Value::as_u64);
        Self {
            max_attempts: ms("/retry/max_attempts")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(d.max_attempts),
            initial_backoff: ms("/retry/initial_backoff_ms")
                .map(Duration::from_millis)
                .unwrap_or(d.initial_backoff),
            max_backoff: ms("/retry/max_backoff_ms")
                .map(Duration::from_millis)
                .unwrap_or(d.max_backoff),
        }
    }

    /// Delay before retry number `retry` (1-based): `initial * 2^(retry-1)`,
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(31);
        let factor = 1u32 << shift;
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
