use rand::Rng;
use std::time::Duration;

/// Reconnection schedule for a [`ResilientChannel`](super::ResilientChannel).
///
/// Retry `n` (1-based) waits `min(max_delay, base_delay · 2^(n-1))` plus a
/// uniform jitter in `[0, jitter_max]`. After `max_retries` consecutive
/// failures the channel gives up and goes `Offline`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_max: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_max: Duration::from_millis(250),
            max_retries: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry `attempt`, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exp)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }

    /// Delay before retry `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay_for(attempt) + jitter
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }
}
