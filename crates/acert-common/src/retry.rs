//! Retry utilities with exponential backoff and jitter.
//!
//! [`Backoff`] is the stateful schedule used by long-running loops that need
//! to reset after a success, such as the agent reconnect loop.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use acert_common::retry::{Backoff, RetryConfig};
//!
//! let mut backoff = Backoff::new(RetryConfig::with_max_attempts(3));
//! assert!(backoff.next_delay().is_some());
//! assert!(backoff.next_delay().is_some());
//! assert_eq!(backoff.next_delay(), None);
//!
//! backoff.reset();
//! assert!(backoff.next_delay().unwrap() <= Duration::from_millis(750));
//! ```

use std::time::Duration;

use rand::Rng;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Stateful backoff schedule.
///
/// Each call to [`Backoff::next_delay`] records one failed attempt and
/// returns how long to wait before the next one, or `None` once the attempt
/// cap is reached. The returned delay is jittered to 0.5x-1.5x of the
/// nominal delay and never exceeds `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    failures: u32,
    delay: Duration,
}

impl Backoff {
    /// Start a fresh schedule
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            failures: 0,
            delay,
        }
    }

    /// Number of consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Configured attempt cap (0 = infinite)
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Record a failure and compute the wait before the next attempt
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.config.max_attempts > 0 && self.failures >= self.config.max_attempts {
            return None;
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * jitter).min(self.config.max_delay.as_secs_f64()),
        );

        self.delay = Duration::from_secs_f64(
            (self.delay.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        Some(jittered)
    }

    /// Forget recorded failures after a success
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.config.initial_delay;
    }
}
