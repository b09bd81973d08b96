use std::time::Duration;

use rand::Rng;

/// Reconnect backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Attempts before giving up permanently. Zero means never give up.
    pub max_attempts: u32,
    /// Fraction of the delay used as a uniform random spread, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            max_attempts: 0,
            jitter: 0.25,
        }
    }
}

/// Exponential backoff with jitter and a bounded attempt count.
///
/// `next()` yields `min(base * 2^attempt, max)` perturbed by a uniform
/// value in `[-jitter * delay, +jitter * delay]`, floored at zero, or
/// `None` once the configured attempt bound is reached. Jitter makes the
/// exact delays non-reproducible; assert on bounds, not values.
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    attempts: u32,
}

impl BackoffPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Delay before the next attempt, or `None` when attempts are
    /// exhausted. Increments the attempt counter.
    pub fn next(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempts >= self.config.max_attempts {
            return None;
        }

        let exponential = self
            .config
            .base
            .saturating_mul(2u32.saturating_pow(self.attempts));
        let delay = exponential.min(self.config.max);
        self.attempts += 1;

        let spread = delay.as_secs_f64() * self.config.jitter;
        if spread > 0.0 {
            let offset = rand::rng().random_range(-spread..=spread);
            Some(Duration::from_secs_f64(
                (delay.as_secs_f64() + offset).max(0.0),
            ))
        } else {
            Some(delay)
        }
    }

    /// Attempts consumed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Called on every successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
