//! Three-state circuit breaker guarding an external collaborator.
//!
//! Closed: calls pass through. After `failure_threshold` consecutive
//! failures the breaker opens and rejects every call with
//! `TaskError::CircuitOpen` without touching the collaborator. Once
//! `timeout` has elapsed since the last failure it goes half-open and
//! admits a single probe: success closes it, failure re-opens it.
//!
//! State lives behind a mutex so runners sharing one breaker never race
//! on the read-modify-write of the failure counter. The lock is never
//! held across the guarded call.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::TaskError;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to stay open before probing (default: 60)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_timeout_seconds() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `last_failure_at`, drives the open timeout
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Guard for one external collaborator; share it via `Arc`
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.timeout_seconds),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, promoting Open to HalfOpen once the timeout elapsed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// The original error is propagated on failure; `CircuitOpen` is only
    /// returned when the call never reached the collaborator.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        self.acquire()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: true,
        };

        let result = op().await;
        guard.armed = false;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    /// Admission check; marks the half-open probe as taken
    fn acquire(&self) -> Result<(), TaskError> {
        let mut inner = self.lock();
        self.refresh(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                debug!(circuit = %self.name, "Admitting half-open probe");
                Ok(())
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!(circuit = %self.name, "Call rejected, circuit open");
                Err(TaskError::CircuitOpen {
                    name: self.name.clone(),
                })
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            // Late success from a call admitted before the breaker opened
            return;
        }
        if inner.state == CircuitState::HalfOpen {
            info!(circuit = %self.name, "Probe succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, error: &TaskError) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(Utc::now());
        inner.last_failure = Some(Instant::now());

        let was_probe = inner.state == CircuitState::HalfOpen;
        inner.probe_in_flight = false;

        if was_probe {
            inner.state = CircuitState::Open;
            warn!(circuit = %self.name, error = %error, "Probe failed, circuit re-opened");
        } else if inner.consecutive_failures >= self.failure_threshold
            && inner.state == CircuitState::Closed
        {
            inner.state = CircuitState::Open;
            warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                timeout_secs = self.timeout.as_secs_f64(),
                error = %error,
                "Failure threshold reached, circuit opened"
            );
        } else {
            debug!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                error = %error,
                "Guarded call failed"
            );
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed() >= self.timeout)
            .unwrap_or(true);
        if elapsed {
            inner.state = CircuitState::HalfOpen;
            inner.probe_in_flight = false;
            info!(circuit = %self.name, "Open timeout elapsed, circuit half-open");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a panic elsewhere; the counters are still valid
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the half-open probe slot if the guarded future is dropped
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}
