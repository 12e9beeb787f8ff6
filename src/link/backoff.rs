//! Reconnect delay policy.

use std::time::Duration;

/// Linear capped backoff: `min(base + attempt * step, max)`.
///
/// A zero `step` gives a fixed delay. `attempt` counts consecutive failures since the
/// last successful connection, starting at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, step: Duration, max: Duration) -> Self {
        Self {
            base,
            step,
            max: max.max(base),
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, Duration::ZERO, delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self
            .step
            .checked_mul(attempt)
            .and_then(|extra| self.base.checked_add(extra))
            .unwrap_or(self.max);
        grown.min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
    }
}
