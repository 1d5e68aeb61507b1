use std::time::Duration;

/// Capped exponential backoff between retry rounds of one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffScheduler {
    /// Base cooldown in milliseconds
    pub cooldown_base_ms: u64,
    /// Growth factor per retry
    pub backoff_exponent: f64,
    /// Upper bound on any single cooldown in milliseconds
    pub cooldown_max_ms: u64,
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self {
            cooldown_base_ms: 2_000,
            backoff_exponent: 1.8,
            cooldown_max_ms: 15_000,
        }
    }
}

impl BackoffScheduler {
    pub fn new(cooldown_base_ms: u64, backoff_exponent: f64, cooldown_max_ms: u64) -> Self {
        Self {
            cooldown_base_ms,
            backoff_exponent,
            cooldown_max_ms,
        }
    }

    /// `min(base * exponent^retry, max)`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp_backoff =
            (self.cooldown_base_ms as f64) * self.backoff_exponent.powi(retry.min(i32::MAX as u32) as i32);
        let capped = if exp_backoff.is_finite() {
            exp_backoff.min(self.cooldown_max_ms as f64)
        } else {
            self.cooldown_max_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
