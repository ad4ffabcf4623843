//! Reconnection backoff for failed servers.

use std::time::Duration;

use super::config::ReconnectConfig;

/// Linear backoff: the wait grows with the number of consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// delay = min(base_delay * consecutive_errors, max_delay)
    pub fn calculate_backoff(&self, consecutive_errors: u32) -> Duration {
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(consecutive_errors as u64);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }

    /// Reconnects are attempted while `consecutive_errors <= max_retries`.
    pub fn should_retry(&self, consecutive_errors: u32) -> bool {
        consecutive_errors <= self.max_retries
    }
}
