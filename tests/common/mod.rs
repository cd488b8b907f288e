//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared test infrastructure including:
//! - proptest configuration presets
//! - fast retry policies so failure paths do not sleep
//! - builders for services and managers backed by the in-memory runtime

#![allow(dead_code)]

use std::sync::Arc;

use isolab::resilience::{RetryPolicies, RetryPolicy};
use isolab::sandbox::{EnvironmentManager, InMemoryRuntime, ManagerOptions};
use isolab::service::AssessmentService;
use isolab::workflow::WorkflowStep;
use proptest::prelude::*;

/// Standard proptest configuration. Each case builds a runtime, so keep the
/// count moderate.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    }
}

pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 2,
        backoff_multiplier: 1.0,
        jitter_ms: 0,
    }
}

pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        retry: RetryPolicies {
            container_creation: fast_policy(2),
            resource_allocation: fast_policy(2),
            network_operation: fast_policy(2),
            analysis_execution: fast_policy(1),
        },
        ..Default::default()
    }
}

pub fn manager() -> (Arc<InMemoryRuntime>, EnvironmentManager) {
    let runtime = Arc::new(InMemoryRuntime::new());
    let manager = EnvironmentManager::new(runtime.clone(), fast_options()).expect("manager");
    (runtime, manager)
}

pub fn service(workflows_dir: &std::path::Path) -> (Arc<InMemoryRuntime>, AssessmentService) {
    let runtime = Arc::new(InMemoryRuntime::new());
    let service = AssessmentService::new(runtime.clone(), fast_options(), workflows_dir).expect("service");
    (runtime, service)
}

/// A `command` tool step running `command` in the sandbox.
pub fn command_step(name: &str, command: &str) -> WorkflowStep {
    let mut step = WorkflowStep {
        name: name.into(),
        tool: "command".into(),
        ..Default::default()
    };
    step.config
        .insert("command".into(), serde_json::Value::String(command.into()));
    step
}

/// Single-threaded runtime for driving async code inside proptest bodies.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
        .block_on(future)
}
