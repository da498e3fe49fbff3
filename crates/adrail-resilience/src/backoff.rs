//! Exponential backoff
//!
//! Retry delays that grow exponentially up to a cap. Jitter is opt-in; the
//! default schedule is deterministic so callers can reason about (and test)
//! exact delays.

use rand::Rng;
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
    /// Jitter factor (0.0 disables; up to 1.0)
    pub jitter: f64,
    /// Maximum number of retry attempts
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Create an aggressive config for fast retries
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: 0.1,
            max_attempts: 10,
        }
    }

    /// Create a conservative config for slow retries
    pub fn conservative() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 3,
        }
    }

    /// The delay before retry number `attempt` (0-indexed), without jitter.
    ///
    /// `min(initial_delay * multiplier^attempt, max_delay)` - the canonical
    /// schedule the scheduler and the iterator both follow.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    // Spreads a delay by +-jitter around its base value.
    pub(crate) fn apply_jitter(&self, base_delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base_delay;
        }

        let mut rng = rand::thread_rng();
        let jitter_range = base_delay.as_secs_f64() * self.jitter;
        let jitter = rng.gen_range(-jitter_range..jitter_range);
        let jittered = base_delay.as_secs_f64() + jitter;

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Exponential backoff iterator
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff instance
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Create with default config
    pub fn default_config() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Get the current attempt number (0-indexed)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempt)
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get the next delay without advancing (peek)
    pub fn peek_delay(&self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        Some(
            self.config
                .apply_jitter(self.config.delay_for_attempt(self.attempt))
                .min(self.config.max_delay),
        )
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }

        let delay = self
            .config
            .apply_jitter(self.config.delay_for_attempt(self.attempt));
        self.attempt += 1;
        Some(delay.min(self.config.max_delay))
    }
}
