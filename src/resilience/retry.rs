//! Retry with exponential backoff and jitter.
//!
//! `with_retry` never returns an error directly: it hands back a
//! [`RetryOutcome`] and the caller decides what a failure means.

use crate::sandbox::error::{AssessmentError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0) as u64;
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }

    /// Same backoff with half the attempt budget (at least one).
    pub fn shortened(&self) -> Self {
        Self {
            max_attempts: (self.max_attempts / 2).max(1),
            ..self.clone()
        }
    }
}

/// Retry policy catalogue, one preset per operation class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicies {
    pub container_creation: RetryPolicy,
    pub resource_allocation: RetryPolicy,
    pub network_operation: RetryPolicy,
    pub analysis_execution: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            container_creation: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1000,
                max_delay_ms: 10_000,
                backoff_multiplier: 2.0,
                jitter_ms: 250,
            },
            resource_allocation: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                backoff_multiplier: 2.0,
                jitter_ms: 100,
            },
            network_operation: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                backoff_multiplier: 2.0,
                jitter_ms: 100,
            },
            analysis_execution: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 2000,
                max_delay_ms: 30_000,
                backoff_multiplier: 2.0,
                jitter_ms: 500,
            },
        }
    }
}

pub type RetryCondition = Arc<dyn Fn(&AssessmentError) -> bool + Send + Sync>;

/// Observer called before each backoff wait with `(attempt, error, delay)`.
pub type RetryObserver = Arc<dyn Fn(u32, &AssessmentError, Duration) + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub policy: RetryPolicy,
    /// Defaults to [`AssessmentError::is_retryable`]
    pub retry_condition: Option<RetryCondition>,
    pub on_retry: Option<RetryObserver>,
}

impl RetryOptions {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_condition: None,
            on_retry: None,
        }
    }

    pub fn with_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&AssessmentError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &AssessmentError, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    fn should_retry(&self, error: &AssessmentError) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }
}

impl From<RetryPolicy> for RetryOptions {
    fn from(policy: RetryPolicy) -> Self {
        Self::new(policy)
    }
}

impl std::fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("policy", &self.policy)
            .field("retry_condition", &self.retry_condition.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// What happened across all attempts
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Run `operation` until it succeeds, the retry condition rejects the error,
/// or `max_attempts` is reached.
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    options: &RetryOptions,
    name: &str,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let max_attempts = options.policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = name, attempt, "Succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                    total_duration: started.elapsed(),
                };
            }
            Err(error) => {
                if attempt >= max_attempts || !options.should_retry(&error) {
                    tracing::warn!(
                        operation = name,
                        attempts = attempt,
                        code = error.code(),
                        "Giving up: {}",
                        error
                    );
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }

                let delay = options.policy.delay_for(attempt);
                tracing::debug!(
                    operation = name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    error
                );
                if let Some(observer) = &options.on_retry {
                    if catch_unwind(AssertUnwindSafe(|| observer(attempt, &error, delay))).is_err() {
                        tracing::warn!(operation = name, "on_retry observer panicked");
                    }
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}
