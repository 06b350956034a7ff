//! Exponential dial backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial: Duration,

    /// Upper bound for any single delay
    pub max: Duration,

    /// Growth factor applied after each attempt
    pub multiplier: f64,

    /// Fraction of the delay randomized in either direction (0.0 disables jitter)
    pub jitter: f64,

    /// Give up after this many attempts (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

/// Retry schedule state for one dial target
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempts: u32,
}

impl Backoff {
    /// Start a fresh schedule
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt, or `None` once attempts are exhausted.
    ///
    /// Base delay is `initial * multiplier^attempts`, capped at `max`, then
    /// jittered and capped again.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(limit) = self.config.max_attempts {
            if self.attempts >= limit {
                return None;
            }
        }

        let exponent = self.attempts.min(32) as i32;
        self.attempts = self.attempts.saturating_add(1);

        let max = self.config.max.as_secs_f64();
        let base = (self.config.initial.as_secs_f64() * self.config.multiplier.powi(exponent))
            .min(max);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            (base * factor).min(max)
        } else {
            base
        };

        Some(Duration::from_secs_f64(delay.max(0.0)))
    }

    /// Forget past failures after a successful dial
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
