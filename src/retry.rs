use serde::{Deserialize, Serialize};

/// Backoff applied when an item's handler fails and attempts remain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_initial_interval_ms")]
    pub initial_interval_ms: i64,
    #[serde(default)]
    pub max_interval_ms: Option<i64>,
    #[serde(default = "RetryPolicy::default_backoff_factor")]
    pub backoff_factor: f64,
    /// Spread retries over `[delay, 2 * delay)` to avoid thundering herds.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: Self::default_initial_interval_ms(),
            max_interval_ms: Some(24 * 60 * 60 * 1_000),
            backoff_factor: Self::default_backoff_factor(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn default_initial_interval_ms() -> i64 {
        10_000
    }

    pub fn default_backoff_factor() -> f64 {
        2.0
    }
}

/// Time (epoch ms) an item should next run after failing.
///
/// `attempt` is the zero-based attempt that just failed; `max_attempts` is the
/// total number of attempts allowed. Returns `None` once attempts are exhausted.
pub fn next_retry_time_ms(
    failure_time_ms: i64,
    attempt: u32,
    max_attempts: u32,
    policy: &RetryPolicy,
) -> Option<i64> {
    if attempt + 1 >= max_attempts {
        return None;
    }

    let exp = attempt.min(62) as i32;
    let mut delay = (policy.initial_interval_ms as f64 * policy.backoff_factor.powi(exp)) as i64;
    if policy.jitter {
        // deterministic per (time, attempt) so a retried script computes the same value
        let mut seed = (failure_time_ms as u64) ^ ((attempt as u64) << 32);
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let frac = ((seed >> 32) as f64) / (u32::MAX as f64);
        delay = (delay as f64 * (1.0 + frac)) as i64;
    }
    if let Some(max) = policy.max_interval_ms {
        delay = delay.min(max);
    }
    Some(failure_time_ms.saturating_add(delay.max(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_interval_ms: 1_000,
            max_interval_ms: None,
            backoff_factor: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn exhausted_attempts_return_none() {
        assert_eq!(next_retry_time_ms(1_000, 2, 3, &policy()), None);
        assert_eq!(next_retry_time_ms(1_000, 0, 1, &policy()), None);
    }

    #[test]
    fn exponential_backoff() {
        let p = policy();
        assert_eq!(next_retry_time_ms(1_000_000, 0, 5, &p), Some(1_001_000));
        assert_eq!(next_retry_time_ms(1_000_000, 1, 5, &p), Some(1_002_000));
        assert_eq!(next_retry_time_ms(1_000_000, 2, 5, &p), Some(1_004_000));
    }

    #[test]
    fn capped_by_max_interval() {
        let mut p = policy();
        p.max_interval_ms = Some(1_500);
        assert_eq!(next_retry_time_ms(100, 3, 10, &p), Some(1_600));
    }

    #[test]
    fn jitter_stays_within_double_delay() {
        let mut p = policy();
        p.jitter = true;
        let at = next_retry_time_ms(5_000, 1, 5, &p).expect("retry");
        assert!((7_000..9_001).contains(&at), "{at}");
    }
}
