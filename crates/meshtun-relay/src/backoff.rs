//! Reconnect backoff

use meshtun_core::config::duration_ms;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters. There is no retry limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay
    #[serde(rename = "initial_ms", with = "duration_ms")]
    pub initial: Duration,

    /// Delay cap
    #[serde(rename = "max_ms", with = "duration_ms")]
    pub max: Duration,

    /// Growth per attempt
    pub multiplier: f64,

    /// Add up to 25% random jitter
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial.as_millis() as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.max.as_millis() as f64);

        let millis = if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0..25) as f64 / 100.0;
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

/// Attempt counter over a [`BackoffConfig`]
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt, then advance
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Failed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay, after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_and_capped() {
        let config = no_jitter();
        assert_eq!(config.delay_for_attempt(0).as_millis(), 100);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 200);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 400);
        assert_eq!(config.delay_for_attempt(10).as_millis(), 10_000);
        assert_eq!(config.delay_for_attempt(u32::MAX).as_millis(), 10_000);
    }

    #[test]
    fn test_jitter_bounds() {
        let config = BackoffConfig {
            jitter: true,
            ..no_jitter()
        };
        for _ in 0..100 {
            let delay = config.delay_for_attempt(1).as_millis();
            assert!((200..250).contains(&delay), "{delay}");
        }
    }

    #[test]
    fn test_counter_resets() {
        let mut backoff = Backoff::new(no_jitter());
        assert_eq!(backoff.next_delay().as_millis(), 100);
        assert_eq!(backoff.next_delay().as_millis(), 200);
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().as_millis(), 100);
    }

    #[test]
    fn test_serde_milliseconds() {
        let config: BackoffConfig = serde_json::from_str(r#"{"initial_ms": 50, "jitter": false}"#).unwrap();
        assert_eq!(config.initial, Duration::from_millis(50));
        assert_eq!(config.max, Duration::from_secs(30));
        assert!(!config.jitter);
    }
}
