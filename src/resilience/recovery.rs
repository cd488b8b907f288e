// Checkpoint and recovery management
//
// Tracks per-environment recovery state and a bounded ring of checkpoints,
// runs registered recovery strategies against failures and builds
// degradation plans for workflows that cannot run in full.

use crate::sandbox::error::{AssessmentError, PartialFailure, Result};
use crate::workflow::{AnalysisResults, WorkflowStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Checkpoints kept per environment; the oldest is evicted first.
pub const CHECKPOINT_LIMIT: usize = 10;

pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Step names that mark a workflow step as nice-to-have.
const SKIPPABLE_NAME_MARKERS: [&str; 3] = ["optional", "enhancement", "optimization"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecoveryState {
    pub container_id: String,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub recovery_attempts: u32,
    pub max_recovery_attempts: u32,
    pub last_error: Option<String>,
}

impl ErrorRecoveryState {
    fn new(container_id: &str, max_recovery_attempts: u32) -> Self {
        Self {
            container_id: container_id.to_string(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            recovery_attempts: 0,
            max_recovery_attempts,
            last_error: None,
        }
    }
}

/// Reference-free snapshot of a step's state and optional result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCheckpoint {
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    pub state: serde_json::Value,
    pub result: Option<serde_json::Value>,
}

/// What the caller should do after a successful recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    RecreateContainer,
    ReduceResources,
    ContinuePartial,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy: Option<String>,
    pub action: RecoveryAction,
    pub message: String,
}

impl RecoveryResult {
    pub fn recovered(strategy: &str, action: RecoveryAction, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy: Some(strategy.to_string()),
            action,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy: None,
            action: RecoveryAction::None,
            message: message.into(),
        }
    }
}

/// A way of getting past a failure
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_recover(&self, error: &AssessmentError, state: &ErrorRecoveryState) -> bool;

    async fn recover(&self, error: &AssessmentError, state: &ErrorRecoveryState) -> RecoveryResult;
}

/// Recreate the sandbox after a container-level failure.
pub struct ContainerRecreation;

#[async_trait]
impl RecoveryStrategy for ContainerRecreation {
    fn name(&self) -> &str {
        "container-recreation"
    }

    fn can_recover(&self, error: &AssessmentError, state: &ErrorRecoveryState) -> bool {
        error.is_container_error() && state.recovery_attempts <= 2
    }

    async fn recover(&self, error: &AssessmentError, _state: &ErrorRecoveryState) -> RecoveryResult {
        RecoveryResult::recovered(
            self.name(),
            RecoveryAction::RecreateContainer,
            format!("recreate container after: {}", error),
        )
    }
}

/// Retry with smaller resource limits after a resource failure.
pub struct ResourceReduction;

#[async_trait]
impl RecoveryStrategy for ResourceReduction {
    fn name(&self) -> &str {
        "resource-reduction"
    }

    fn can_recover(&self, error: &AssessmentError, state: &ErrorRecoveryState) -> bool {
        error.is_resource_error() && state.recovery_attempts <= 3
    }

    async fn recover(&self, error: &AssessmentError, _state: &ErrorRecoveryState) -> RecoveryResult {
        RecoveryResult::recovered(
            self.name(),
            RecoveryAction::ReduceResources,
            format!("reduce resource limits after: {}", error),
        )
    }
}

/// Keep going with what already completed after an analysis failure.
pub struct PartialContinuation;

#[async_trait]
impl RecoveryStrategy for PartialContinuation {
    fn name(&self) -> &str {
        "partial-continuation"
    }

    fn can_recover(&self, error: &AssessmentError, state: &ErrorRecoveryState) -> bool {
        error.is_analysis_error() && !state.completed_steps.is_empty()
    }

    async fn recover(&self, _error: &AssessmentError, state: &ErrorRecoveryState) -> RecoveryResult {
        RecoveryResult::recovered(
            self.name(),
            RecoveryAction::ContinuePartial,
            format!(
                "continue with {} completed step(s)",
                state.completed_steps.len()
            ),
        )
    }
}

/// Reduced plan for the rest of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradationPlan {
    pub skipped_steps: Vec<String>,
    pub modified_steps: Vec<WorkflowStep>,
    pub can_continue: bool,
    pub reason: String,
}

pub struct RecoveryManager {
    states: DashMap<String, ErrorRecoveryState>,
    checkpoints: DashMap<String, VecDeque<RecoveryCheckpoint>>,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    max_recovery_attempts: u32,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }
}

impl RecoveryManager {
    /// Manager with the built-in strategies registered in order.
    pub fn new(max_recovery_attempts: u32) -> Self {
        let strategies: Vec<Arc<dyn RecoveryStrategy>> = vec![
            Arc::new(ContainerRecreation),
            Arc::new(ResourceReduction),
            Arc::new(PartialContinuation),
        ];
        Self {
            states: DashMap::new(),
            checkpoints: DashMap::new(),
            strategies,
            max_recovery_attempts,
        }
    }

    pub fn register_strategy(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        self.strategies.push(strategy);
    }

    pub fn state(&self, container_id: &str) -> Option<ErrorRecoveryState> {
        self.states.get(container_id).map(|s| s.clone())
    }

    fn with_state<R>(&self, container_id: &str, f: impl FnOnce(&mut ErrorRecoveryState) -> R) -> R {
        let mut entry = self
            .states
            .entry(container_id.to_string())
            .or_insert_with(|| ErrorRecoveryState::new(container_id, self.max_recovery_attempts));
        f(entry.value_mut())
    }

    pub fn record_step_completed(&self, container_id: &str, step: &str) {
        self.with_state(container_id, |state| {
            if !state.completed_steps.iter().any(|s| s == step) {
                state.completed_steps.push(step.to_string());
            }
        });
    }

    pub fn record_step_failed(&self, container_id: &str, step: &str, error: &AssessmentError) {
        self.with_state(container_id, |state| {
            if !state.failed_steps.iter().any(|s| s == step) {
                state.failed_steps.push(step.to_string());
            }
            state.last_error = Some(error.to_string());
        });
    }

    pub fn create_checkpoint(
        &self,
        container_id: &str,
        step_name: &str,
        state: serde_json::Value,
        result: Option<serde_json::Value>,
    ) {
        let mut ring = self.checkpoints.entry(container_id.to_string()).or_default();
        if ring.len() == CHECKPOINT_LIMIT {
            ring.pop_front();
        }
        ring.push_back(RecoveryCheckpoint {
            step_name: step_name.to_string(),
            timestamp: Utc::now(),
            state,
            result,
        });
        tracing::debug!(env_id = %container_id, step = step_name, "Checkpoint recorded");
    }

    pub fn checkpoints(&self, container_id: &str) -> Vec<RecoveryCheckpoint> {
        self.checkpoints
            .get(container_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_checkpoint(&self, container_id: &str) -> Option<RecoveryCheckpoint> {
        self.checkpoints
            .get(container_id)
            .and_then(|ring| ring.back().cloned())
    }

    /// Try each registered strategy in order and return the first success.
    pub async fn attempt_recovery(&self, container_id: &str, error: &AssessmentError) -> RecoveryResult {
        let snapshot = self.with_state(container_id, |state| {
            state.last_error = Some(error.to_string());
            state.clone()
        });

        if snapshot.recovery_attempts >= snapshot.max_recovery_attempts {
            tracing::warn!(
                env_id = %container_id,
                attempts = snapshot.recovery_attempts,
                "Recovery attempts exhausted"
            );
            return RecoveryResult::failed(format!(
                "maximum recovery attempts ({}) reached",
                snapshot.max_recovery_attempts
            ));
        }
        self.with_state(container_id, |state| state.recovery_attempts += 1);

        if error.is_security_violation() {
            return RecoveryResult::failed("security violations are never recovered");
        }

        for strategy in &self.strategies {
            if !strategy.can_recover(error, &snapshot) {
                continue;
            }
            let result = strategy.recover(error, &snapshot).await;
            if result.success {
                tracing::info!(
                    env_id = %container_id,
                    strategy = strategy.name(),
                    action = ?result.action,
                    "Recovery strategy succeeded"
                );
                return result;
            }
            tracing::debug!(
                env_id = %container_id,
                strategy = strategy.name(),
                "Recovery strategy declined: {}",
                result.message
            );
        }

        RecoveryResult::failed(format!("no strategy could recover from: {}", error))
    }

    /// Split the remaining steps into ones to skip and ones to run in a
    /// reduced form.
    pub fn create_degradation_plan(&self, remaining: &[WorkflowStep], failed_step: &str) -> DegradationPlan {
        let mut skipped_steps = Vec::new();
        let mut modified_steps = Vec::new();

        for step in remaining {
            if is_skippable(step) {
                skipped_steps.push(step.name.clone());
            } else {
                modified_steps.push(degrade_step(step));
            }
        }

        let can_continue = !modified_steps.is_empty();
        DegradationPlan {
            reason: format!(
                "step '{}' failed; skipping {} and reducing {} step(s)",
                failed_step,
                skipped_steps.len(),
                modified_steps.len()
            ),
            skipped_steps,
            modified_steps,
            can_continue,
        }
    }

    /// Package what survived into a partial-analysis error.
    pub fn preserve_partial_results(
        &self,
        container_id: &str,
        partial_results: AnalysisResults,
        cause: &AssessmentError,
    ) -> AssessmentError {
        let state = self
            .state(container_id)
            .unwrap_or_else(|| ErrorRecoveryState::new(container_id, self.max_recovery_attempts));
        AssessmentError::PartialAnalysis(Box::new(PartialFailure {
            environment_id: container_id.to_string(),
            completed_steps: state.completed_steps,
            failed_steps: state.failed_steps,
            last_checkpoint: self.last_checkpoint(container_id),
            partial_results,
            cause: cause.to_string(),
        }))
    }

    /// Restore the most recent checkpoint for `step_name`.
    pub fn restore_checkpoint(&self, container_id: &str, step_name: &str) -> Result<RecoveryCheckpoint> {
        self.checkpoints
            .get(container_id)
            .and_then(|ring| ring.iter().rev().find(|c| c.step_name == step_name).cloned())
            .ok_or_else(|| {
                AssessmentError::NotFound(format!(
                    "no checkpoint for step '{}' in {}",
                    step_name, container_id
                ))
            })
    }

    /// Forget everything about an environment.
    pub fn clear(&self, container_id: &str) {
        self.states.remove(container_id);
        self.checkpoints.remove(container_id);
    }
}

fn is_skippable(step: &WorkflowStep) -> bool {
    if step.continue_on_error {
        return true;
    }
    let tool = step.tool.to_ascii_lowercase();
    if tool == "test" || tool == "custom" || tool.starts_with("test-") {
        return true;
    }
    let name = step.name.to_ascii_lowercase();
    SKIPPABLE_NAME_MARKERS.iter().any(|marker| name.contains(marker))
}

fn degrade_step(step: &WorkflowStep) -> WorkflowStep {
    let mut degraded = step.clone();
    degraded.timeout = step.timeout.map(|t| (t / 2).max(1));
    degraded.continue_on_error = true;
    if let Some(serde_json::Value::String(command)) = step.config.get("command") {
        let reduced = shrink_command_flags(command);
        degraded
            .config
            .insert("command".to_string(), serde_json::Value::String(reduced));
    }
    degraded
}

/// Halve the values of `--memory` and `--timeout` flags in a command line.
pub(crate) fn shrink_command_flags(command: &str) -> String {
    const FLAGS: [&str; 2] = ["--memory", "--timeout"];

    let mut out: Vec<String> = Vec::new();
    let mut halve_next = false;
    for token in command.split_whitespace() {
        if halve_next {
            out.push(halve_quantity(token));
            halve_next = false;
            continue;
        }
        if FLAGS.contains(&token) {
            halve_next = true;
            out.push(token.to_string());
            continue;
        }
        match token.split_once('=') {
            Some((flag, value)) if FLAGS.contains(&flag) => {
                out.push(format!("{}={}", flag, halve_quantity(value)));
            }
            _ => out.push(token.to_string()),
        }
    }
    out.join(" ")
}

/// "512m" -> "256m", "30" -> "15", "1s" -> "1s"
fn halve_quantity(value: &str) -> String {
    let digits_end = value
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(digits_end);
    match digits.parse::<u64>() {
        Ok(n) if n > 0 => format!("{}{}", (n / 2).max(1), suffix),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(name: &str, tool: &str) -> WorkflowStep {
        WorkflowStep {
            name: name.to_string(),
            tool: tool.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_checkpoint_ring_keeps_latest_ten() {
        let manager = RecoveryManager::default();
        for i in 0..15 {
            manager.create_checkpoint("env", &format!("step-{}", i), json!({ "i": i }), None);
        }

        let names: Vec<String> = manager
            .checkpoints("env")
            .into_iter()
            .map(|c| c.step_name)
            .collect();
        let expected: Vec<String> = (5..15).map(|i| format!("step-{}", i)).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_recovery_fails_fast_after_max_attempts() {
        let manager = RecoveryManager::new(2);
        let error = AssessmentError::ContainerStart("daemon".into());

        assert!(manager.attempt_recovery("env", &error).await.success);
        assert!(manager.attempt_recovery("env", &error).await.success);

        let third = manager.attempt_recovery("env", &error).await;
        assert!(!third.success);
        assert_eq!(manager.state("env").unwrap().recovery_attempts, 2);
    }

    #[tokio::test]
    async fn test_strategy_selection_by_error_class() {
        let manager = RecoveryManager::default();

        let container = manager
            .attempt_recovery("a", &AssessmentError::ContainerCreation("x".into()))
            .await;
        assert_eq!(container.action, RecoveryAction::RecreateContainer);

        let resource = manager
            .attempt_recovery("b", &AssessmentError::InsufficientResources("x".into()))
            .await;
        assert_eq!(resource.action, RecoveryAction::ReduceResources);

        // Analysis failure with nothing completed has no strategy
        let analysis_err = AssessmentError::AnalysisFailed("lint".into());
        assert!(!manager.attempt_recovery("c", &analysis_err).await.success);

        manager.record_step_completed("d", "setup");
        let partial = manager.attempt_recovery("d", &analysis_err).await;
        assert_eq!(partial.action, RecoveryAction::ContinuePartial);
    }

    #[tokio::test]
    async fn test_security_violation_never_recovers() {
        let manager = RecoveryManager::default();
        let error = AssessmentError::violation(
            crate::sandbox::error::ViolationKind::MaliciousCode,
            "eval(",
        );
        assert!(!manager.attempt_recovery("env", &error).await.success);
    }

    #[test]
    fn test_degradation_plan_classification() {
        let manager = RecoveryManager::default();
        let mut lint = step("lint", "command");
        lint.timeout = Some(60_000);
        lint.config.insert(
            "command".to_string(),
            json!("analyzer --memory 512m --timeout=300 src"),
        );
        let mut flaky = step("audit", "command");
        flaky.continue_on_error = true;

        let remaining = vec![
            lint,
            flaky,
            step("unit", "test"),
            step("optional-docs", "command"),
            step("perf-optimization", "command"),
        ];
        let plan = manager.create_degradation_plan(&remaining, "build");

        assert_eq!(
            plan.skipped_steps,
            vec!["audit", "unit", "optional-docs", "perf-optimization"]
        );
        assert_eq!(plan.modified_steps.len(), 1);
        let degraded = &plan.modified_steps[0];
        assert_eq!(degraded.timeout, Some(30_000));
        assert!(degraded.continue_on_error);
        assert_eq!(
            degraded.config.get("command").unwrap(),
            &json!("analyzer --memory 256m --timeout=150 src")
        );
        assert!(plan.can_continue);
    }

    #[test]
    fn test_degradation_plan_nothing_left() {
        let manager = RecoveryManager::default();
        let plan = manager.create_degradation_plan(&[step("unit", "test")], "build");
        assert!(!plan.can_continue);
    }

    #[test]
    fn test_preserve_partial_results() {
        let manager = RecoveryManager::default();
        manager.record_step_completed("env", "setup");
        manager.record_step_failed("env", "lint", &AssessmentError::AnalysisFailed("x".into()));
        manager.create_checkpoint("env", "setup", json!({}), None);

        let error = manager.preserve_partial_results(
            "env",
            AnalysisResults::default(),
            &AssessmentError::AnalysisFailed("lint crashed".into()),
        );
        match error {
            AssessmentError::PartialAnalysis(partial) => {
                assert_eq!(partial.completed_steps, vec!["setup"]);
                assert_eq!(partial.failed_steps, vec!["lint"]);
                assert_eq!(partial.last_checkpoint.unwrap().step_name, "setup");
            }
            other => panic!("expected partial analysis, got {:?}", other),
        }
    }

    #[test]
    fn test_clear_discards_state() {
        let manager = RecoveryManager::default();
        manager.record_step_completed("env", "setup");
        manager.create_checkpoint("env", "setup", json!({}), None);
        manager.clear("env");

        assert!(manager.state("env").is_none());
        assert!(manager.checkpoints("env").is_empty());
        assert!(manager.restore_checkpoint("env", "setup").is_err());
    }
}
