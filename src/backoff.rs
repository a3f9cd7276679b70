//! Recovery backoff policies for re-establishing queues and consumers.

use std::time::Duration;

use serde::Deserialize;

/// Exponential backoff policy with full jitter.
///
/// Attempt `0` is immediate, attempt `1` waits exactly [`min`](Self::min),
/// and every later attempt waits
/// `round((1 + rand01) * min * factor^(attempt - 1))` milliseconds, clamped
/// to [`max`](Self::max). The jitter multiplier spreads simultaneous
/// reconnects of many processes apart.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    /// Delay for the first retry, in milliseconds.
    pub min: u64,
    /// Upper bound for any computed delay, in milliseconds.
    pub max: u64,
    /// Exponential growth factor applied per attempt.
    pub factor: f64,
}

impl RecoveryPolicy {
    /// Policy used when re-creating the private reply queue.
    #[must_use]
    pub fn private_default() -> Self {
        Self {
            min: 250,
            max: 1000,
            factor: 0.2,
        }
    }

    /// Policy used when re-establishing consumed queues.
    #[must_use]
    pub fn consumed_default() -> Self {
        Self {
            min: 500,
            max: 5000,
            factor: 0.2,
        }
    }

    /// Computes the delay before the given retry attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            1 => Duration::from_millis(self.min),
            n => {
                let jitter = 1.0 + rand::random::<f64>();
                #[allow(clippy::cast_precision_loss)]
                let raw = jitter * self.min as f64 * self.factor.powi(n as i32 - 1);
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                Duration::from_millis((raw.round() as u64).min(self.max))
            }
        }
    }

    /// Sleeps for the delay of the given attempt.
    pub async fn sleep(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::consumed_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        let policy = RecoveryPolicy::private_default();
        assert_eq!(policy.delay(0), Duration::ZERO);
    }

    #[test]
    fn second_attempt_waits_exactly_min() {
        let policy = RecoveryPolicy::private_default();
        assert_eq!(policy.delay(1), Duration::from_millis(policy.min));
    }

    #[test]
    fn later_attempts_stay_within_jitter_bounds() {
        let policy = RecoveryPolicy::consumed_default();
        for attempt in 2..6 {
            let base = policy.min as f64 * policy.factor.powi(attempt as i32 - 1);
            let delay = policy.delay(attempt).as_millis() as u64;
            let lower = base.floor() as u64;
            let upper = ((2.0 * base).ceil() as u64).min(policy.max);
            assert!(
                delay >= lower && delay <= upper,
                "attempt {attempt}: {delay}ms outside [{lower}, {upper}]"
            );
        }
    }

    #[test]
    fn delay_never_exceeds_max() {
        let policy = RecoveryPolicy {
            min: 4000,
            max: 5000,
            factor: 3.0,
        };
        for attempt in 2..10 {
            assert!(policy.delay(attempt) <= Duration::from_millis(policy.max));
        }
    }

    #[test]
    fn deserializes_partial_maps() {
        let policy: RecoveryPolicy = serde_json::from_str(r#"{"min": 100}"#).unwrap();
        assert_eq!(policy.min, 100);
        assert_eq!(policy.max, RecoveryPolicy::default().max);
    }
}
