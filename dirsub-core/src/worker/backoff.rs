use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Delay before retry number `retry` (0 for the first retry):
/// `base * 2^retry` capped at `backoff_max`, with symmetric jitter.
pub fn retry_delay(retry: u32, config: &RetryConfig) -> Duration {
    let unit: f64 = rand::rng().random();
    retry_delay_with_unit(retry, config, unit)
}

/// Deterministic variant of [`retry_delay`]; `unit` in `[0, 1)` picks the jitter.
pub fn retry_delay_with_unit(retry: u32, config: &RetryConfig, unit: f64) -> Duration {
    let base = config.backoff_base_ms as f64;
    let max = config.backoff_max_ms as f64;
    let exp = base * 2f64.powi(retry.min(32) as i32);
    let capped = exp.min(max);

    let ratio = f64::from(config.jitter_ratio).clamp(0.0, 1.0);
    let factor = 1.0 + ratio * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
    let jittered = (capped * factor).clamp(0.0, max);
    Duration::from_millis(jittered.round() as u64)
}

/// Idle poll backoff: doubles from `min` to `max` while no work shows up.
#[derive(Clone, Debug)]
pub struct IdleBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
        }
    }

    /// Next sleep, jittered into `[current / 2, current]`.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.current;
        self.current = (self.current * 2).min(self.max);

        let half = current / 2;
        let spread = current.saturating_sub(half).as_millis() as u64;
        if spread == 0 {
            return current;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
