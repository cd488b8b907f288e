//! Resilience layer: retry with backoff, circuit breaking and
//! checkpoint-based recovery. Every risky sandbox operation goes through
//! one of these.

pub mod circuit;
pub mod recovery;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitBreakerSettings, CircuitState};
pub use recovery::{
    DegradationPlan, ErrorRecoveryState, RecoveryAction, RecoveryCheckpoint, RecoveryManager,
    RecoveryResult, RecoveryStrategy, CHECKPOINT_LIMIT, DEFAULT_MAX_RECOVERY_ATTEMPTS,
};
pub use retry::{with_retry, RetryOptions, RetryOutcome, RetryPolicies, RetryPolicy};
