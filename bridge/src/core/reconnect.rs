//! Backoff policy for SSE stream resumption.

use std::time::Duration;

use super::config::HttpConfig;

/// Exponential backoff schedule for resuming a dropped event stream.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &HttpConfig) -> Self {
        let base_delay = config.reconnect_base_delay();
        let factor = 2u32.saturating_pow(config.max_reconnect_attempts.saturating_sub(1).min(31));
        Self {
            max_attempts: config.max_reconnect_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(factor),
        }
    }

    /// delay = min(base_delay * 2^(attempt-1), max_delay)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}
