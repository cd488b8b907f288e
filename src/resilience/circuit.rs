//! Circuit breaker: closed -> open -> half-open -> closed.

use crate::sandbox::error::{AssessmentError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    /// Successful probes needed in half-open before closing again
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            success_threshold: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Half-open admits one call at a time
    probe_in_flight: bool,
}

/// Releases the half-open slot if a probe is dropped before it finishes.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    held: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.held {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// Stops calling a failing dependency until a cool-down elapses.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self::new(
            name,
            settings.failure_threshold,
            Duration::from_millis(settings.recovery_timeout_ms),
            settings.success_threshold,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn rejection(&self, wait: Duration) -> AssessmentError {
        AssessmentError::CircuitOpen(format!("{} rejected call; retry in {:?}", self.name, wait))
    }

    /// Decide whether a call may go through, moving open -> half-open once
    /// the recovery timeout has elapsed. Returns true when the call is the
    /// half-open probe.
    fn admit(&self) -> Result<bool> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(self.rejection(Duration::ZERO));
                }
                inner.probe_in_flight = true;
                Ok(true)
            }
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    tracing::info!(breaker = %self.name, "Circuit half-open, probing");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.rejection(self.recovery_timeout.saturating_sub(elapsed)))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.success_threshold {
                tracing::info!(breaker = %self.name, "Circuit closed");
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.probe_in_flight = false;
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            tracing::warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Run `operation` through the breaker. Rejected calls never invoke it.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut slot = ProbeSlot {
            breaker: self,
            held: self.admit()?,
        };
        let outcome = operation().await;
        slot.held = false;
        match outcome {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> Result<()> {
        Err(AssessmentError::ContainerCreation("daemon down".into()))
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let breaker = CircuitBreaker::new("docker", 3, Duration::from_secs(1), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.call(|| async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("docker", 3, Duration::from_secs(1), 1);
        let _ = breaker.call(|| async { failing() }).await;
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.failure_count(), 2);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("docker", 1, Duration::from_millis(100), 1);
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(150)).await;
        let _ = breaker.call(|| async { failing() }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejected = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(AssessmentError::CircuitOpen(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_in_half_open() {
        let breaker = CircuitBreaker::new("docker", 1, Duration::from_millis(10), 2);
        let _ = breaker.call(|| async { failing() }).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_call() {
        let breaker = CircuitBreaker::new("docker", 1, Duration::from_millis(10), 1);
        let _ = breaker.call(|| async { failing() }).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        let invoked = &std::sync::atomic::AtomicU32::new(0);
        let trial = move || async move {
            invoked.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        };
        let (a, b, c) = tokio::join!(breaker.call(trial), breaker.call(trial), breaker.call(trial));

        assert_eq!(invoked.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(a.is_ok());
        assert!(matches!(b, Err(AssessmentError::CircuitOpen(_))));
        assert!(matches!(c, Err(AssessmentError::CircuitOpen(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_call_frees_half_open_slot() {
        let breaker = CircuitBreaker::new("docker", 1, Duration::from_millis(10), 1);
        let _ = breaker.call(|| async { failing() }).await;
        tokio::time::advance(Duration::from_millis(20)).await;

        let stalled = tokio::time::timeout(
            Duration::from_millis(1),
            breaker.call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
