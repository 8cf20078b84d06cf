//! Redelivery backoff after a nak.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay applied before a nak'd message becomes deliverable again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Redeliver immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: ms,
            max_delay_ms: ms,
            jitter: 0.0,
        }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            jitter: 0.1,
        }
    }

    /// Delay before redelivering after the `attempt`-th failed delivery (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay_ms as f64;
        let max_ms = self.max_delay_ms as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic pseudo-jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Reason this policy is unusable, if any.
    pub fn problem(&self) -> Option<String> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Some(format!("jitter {} outside [0, 1]", self.jitter));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Some(format!(
                "max_delay_ms {} is below base_delay_ms {}",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        None
    }
}
