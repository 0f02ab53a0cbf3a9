//! Exponential backoff with additive jitter.
//!
//! The delay before retry `k` (0-indexed) is
//! `min(base_delay * 2^k, max_delay)` plus a jitter drawn uniformly from
//! `[0, delay * 0.5]`. Only errors the classifier marks retryable are
//! retried; everything else propagates on first occurrence.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::error::TaskError;

/// Upper bound of the jitter term, as a fraction of the backoff floor
pub const JITTER_RATIO: f64 = 0.5;

/// Retry policy for calls to unreliable collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Cap on the backoff floor in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// `TaskError::kind()` values that are worth retrying
    #[serde(default = "default_retryable_kinds")]
    pub retryable_error_kinds: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_retryable_kinds() -> Vec<String> {
    vec![
        "timeout".to_string(),
        "connection".to_string(),
        "resource_exhausted".to_string(),
        "rate_limited".to_string(),
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            retryable_error_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Replace the retryable kinds
    pub fn with_retryable_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Backoff floor before retry `attempt` (0-indexed), without jitter
    pub fn backoff_floor(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }

    /// Actual delay before retry `attempt`: floor plus jitter in `[0, floor/2]`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let floor = self.backoff_floor(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
        floor + floor.mul_f64(jitter)
    }

    /// Whether `error` is classified retryable by this policy
    pub fn is_retryable(&self, error: &TaskError) -> bool {
        self.retryable_error_kinds
            .iter()
            .any(|kind| kind == error.kind())
    }

    /// Run `op`, retrying errors whose kind is listed in `retryable_error_kinds`
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        self.execute_with(op, |e| self.is_retryable(e)).await
    }

    /// Run `op` with a caller-supplied classifier; works for any error type
    #[instrument(skip_all, fields(max_retries = self.max_retries))]
    pub async fn execute_with<T, E, F, Fut, C>(&self, mut op: F, is_retryable: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Call succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => {
                    debug!(error = %e, "Non-retryable error, giving up");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_retries => {
                    warn!(attempts = attempt + 1, error = %e, "Retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_floor_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_millis(10_000));

        assert_eq!(policy.backoff_floor(0), Duration::from_millis(1000));
        assert_eq!(policy.backoff_floor(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff_floor(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff_floor(3), Duration::from_millis(8000));
        assert_eq!(policy.backoff_floor(4), Duration::from_millis(10_000)); // Capped
        assert_eq!(policy.backoff_floor(60), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_is_additive_and_bounded() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(1000));

        for attempt in 0..6 {
            let floor = policy.backoff_floor(attempt);
            for _ in 0..200 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay >= floor);
                assert!(delay <= floor.mul_f64(1.0 + JITTER_RATIO));
            }
        }
    }

    #[test]
    fn test_default_classification() {
        let policy = RetryPolicy::default();

        assert!(policy.is_retryable(&TaskError::transient("timeout", "slow")));
        assert!(policy.is_retryable(&TaskError::transient("connection", "reset")));
        assert!(!policy.is_retryable(&TaskError::transient("disk_full", "nope")));
        assert!(!policy.is_retryable(&TaskError::fatal("missing input")));
    }

    #[test]
    fn test_policy_from_yaml_uses_defaults() {
        let policy: RetryPolicy = serde_yaml::from_str("max_retries: 5").unwrap();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay_ms, 1000);
        assert_eq!(policy.retryable_error_kinds.len(), 4);
    }
}
