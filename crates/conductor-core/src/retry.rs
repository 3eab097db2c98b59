//! Retry policy: decides how often to try and how long to back off.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Retry policy for handler / step execution.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1).
    pub max_attempts: u32,

    /// Backoff multiplier (>= 1.0).
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,

    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s initial delay doubling up to 30s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_multiplier: 2.0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff_multiplier,
            initial_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_multiplier: 1.0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Calculate the delay after the failed attempt `attempt` (0-indexed).
    ///
    /// delay = min(initial_delay * backoff_multiplier^attempt, max_delay)
    ///
    /// Example with initial=10ms, multiplier=2.0, max=100ms:
    /// - attempt 0: 10ms
    /// - attempt 1: 20ms
    /// - attempt 3: 80ms
    /// - attempt 4: 100ms (capped)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let delay_nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(delay_nanos as u64)
    }

    /// Attempts actually allowed (a zero `max_attempts` still runs once).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "initial_delay {:?} exceeds max_delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}

/// `Duration` <-> integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(10), 2.0, Duration::from_millis(100))
    }

    #[rstest]
    #[case(0, 10)]
    #[case(1, 20)]
    #[case(2, 40)]
    #[case(3, 80)]
    #[case(4, 100)]
    #[case(30, 100)]
    fn exponential_backoff_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(policy().next_delay(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn delays_never_decrease() {
        let p = policy();
        let delays: Vec<_> = (0..10).map(|n| p.next_delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        assert_eq!(policy().next_delay(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn validation_rejects_bad_policies() {
        assert!(policy().validate().is_ok());
        assert!(RetryPolicy { max_attempts: 0, ..policy() }.validate().is_err());
        assert!(RetryPolicy { backoff_multiplier: 0.5, ..policy() }.validate().is_err());
        assert!(RetryPolicy { backoff_multiplier: f64::NAN, ..policy() }.validate().is_err());
        assert!(
            RetryPolicy { initial_delay: Duration::from_secs(1), ..policy() }
                .validate()
                .is_err()
        );
    }

    #[test]
    fn serializes_delays_as_millis() {
        let json = serde_json::to_value(policy()).unwrap();
        assert_eq!(json["initial_delay_ms"], 10);
        assert_eq!(json["max_delay_ms"], 100);

        let back: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 2,
            "initial_delay_ms": 5,
            "max_delay_ms": 50
        }))
        .unwrap();
        assert_eq!(back.backoff_multiplier, 2.0);
        assert_eq!(back.initial_delay, Duration::from_millis(5));
    }
}
