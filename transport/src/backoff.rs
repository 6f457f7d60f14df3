use std::time::Duration;

/// Default delay before the first reconnection attempt.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Default ceiling on the reconnection delay.
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(5);

/// Linear reconnection backoff with a ceiling. Attempts are unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnection attempt `attempt` (1-based):
    /// `min(base * attempt, max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt.max(1)).min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE, DEFAULT_RECONNECT_MAX)
    }
}
