// Workflow orchestrator
//
// Runs a workflow definition against a ready environment: sequential steps
// in declaration order, then each parallel group fanned out and joined,
// then cleanup steps regardless of outcome. Every step is retried with
// backoff and checkpointed on completion.

use super::conditions;
use super::definition::{WorkflowDefinition, WorkflowStep};
use super::results::AnalysisResults;
use super::tools::{ToolContext, ToolRegistry};
use crate::resilience::{with_retry, RecoveryAction, RecoveryManager, RetryOptions, RetryPolicy};
use crate::sandbox::error::{AssessmentError, Result};
use crate::sandbox::runtime::SharedRuntime;
use crate::sandbox::types::AssessmentEnvironment;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowError {
    pub step: String,
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub workflow: String,
    /// No step failed and nothing was degraded
    pub success: bool,
    pub results: AnalysisResults,
    pub executed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub errors: Vec<WorkflowError>,
    pub duration_ms: u64,
    pub degraded: bool,
}

enum StepOutcome {
    Executed(AnalysisResults),
    Skipped(String),
    Failed(AssessmentError),
}

enum Phase {
    Sequential(WorkflowStep),
    Parallel(Vec<WorkflowStep>),
}

impl Phase {
    fn steps(&self) -> Vec<&WorkflowStep> {
        match self {
            Phase::Sequential(step) => vec![step],
            Phase::Parallel(steps) => steps.iter().collect(),
        }
    }
}

/// Accumulated state of one run
#[derive(Default)]
struct Run {
    result: WorkflowResult,
    skip: HashSet<String>,
    overrides: HashMap<String, WorkflowStep>,
}

pub struct WorkflowOrchestrator {
    runtime: SharedRuntime,
    tools: Arc<ToolRegistry>,
    recovery: Arc<RecoveryManager>,
    backoff: RetryPolicy,
    mount_point: String,
    default_step_timeout: Duration,
}

impl WorkflowOrchestrator {
    pub fn new(
        runtime: SharedRuntime,
        tools: Arc<ToolRegistry>,
        recovery: Arc<RecoveryManager>,
        backoff: RetryPolicy,
        mount_point: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            tools,
            recovery,
            backoff,
            mount_point: mount_point.into(),
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    fn context(&self, env: &AssessmentEnvironment, step: &WorkflowStep) -> ToolContext {
        ToolContext {
            environment_id: env.id.clone(),
            container_id: env.id.clone(),
            mount_point: self.mount_point.clone(),
            analysis_config: env.analysis_config.clone(),
            runtime: self.runtime.clone(),
            timeout: self.step_timeout(step),
        }
    }

    fn step_timeout(&self, step: &WorkflowStep) -> Duration {
        step.timeout
            .map(Duration::from_millis)
            .unwrap_or(self.default_step_timeout)
    }

    /// Execute `workflow` against `env`.
    ///
    /// Returns the aggregated result, a `PartialAnalysis` error carrying what
    /// completed when a non-recoverable step failure cannot be degraded
    /// around, or a security violation unchanged.
    pub async fn execute(
        &self,
        env: &AssessmentEnvironment,
        workflow: &WorkflowDefinition,
    ) -> Result<WorkflowResult> {
        workflow.validate()?;
        let started = Instant::now();
        info!(
            env_id = %env.id,
            workflow = %workflow.name,
            steps = workflow.steps.len(),
            groups = workflow.parallel_steps.len(),
            "Workflow started"
        );

        let mut phases: Vec<Phase> = workflow
            .sequential_steps()
            .into_iter()
            .map(|s| Phase::Sequential(s.clone()))
            .collect();
        phases.extend(
            workflow
                .parallel_groups()
                .into_iter()
                .map(|group| Phase::Parallel(group.into_iter().cloned().collect())),
        );

        let mut run = Run {
            result: WorkflowResult {
                workflow: workflow.name.clone(),
                ..Default::default()
            },
            ..Default::default()
        };

        for index in 0..phases.len() {
            let steps: Vec<WorkflowStep> = phases[index]
                .steps()
                .into_iter()
                .map(|s| run.overrides.get(&s.name).cloned().unwrap_or_else(|| s.clone()))
                .collect();

            let outcomes = match &phases[index] {
                Phase::Sequential(_) => vec![self.run_step(env, &steps[0], &run.skip).await],
                Phase::Parallel(_) => {
                    debug!(env_id = %env.id, group = index, size = steps.len(), "Running parallel group");
                    join_all(steps.iter().map(|s| self.run_step(env, s, &run.skip))).await
                }
            };

            let mut abort: Option<(String, AssessmentError)> = None;
            for (step, outcome) in steps.iter().zip(outcomes) {
                // A violation skips cleanup: the caller terminates the container
                // and cleanup steps would run inside the breached sandbox.
                if let Some(failure) = self.record(env, &mut run, step, outcome)? {
                    if abort.is_none() {
                        abort = Some(failure);
                    }
                }
            }

            if let Some((failed_step, cause)) = abort {
                let remaining: Vec<WorkflowStep> = phases[index + 1..]
                    .iter()
                    .flat_map(|p| p.steps())
                    .filter(|s| !run.skip.contains(&s.name))
                    .cloned()
                    .collect();
                if !self.degrade(env, &mut run, &failed_step, &cause, &remaining).await {
                    self.run_cleanup(env, workflow, &mut run).await;
                    return Err(self.abort_error(env, run, cause));
                }
            }
        }

        self.run_cleanup(env, workflow, &mut run).await;

        let mut result = run.result;
        result.success = result.errors.is_empty() && !result.degraded;
        result.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            env_id = %env.id,
            workflow = %workflow.name,
            executed = result.executed_steps.len(),
            skipped = result.skipped_steps.len(),
            errors = result.errors.len(),
            degraded = result.degraded,
            duration_ms = result.duration_ms,
            "Workflow finished"
        );
        Ok(result)
    }

    /// Fold one step outcome into the run. Returns the step and error when
    /// the failure is not recoverable; security violations propagate.
    fn record(
        &self,
        env: &AssessmentEnvironment,
        run: &mut Run,
        step: &WorkflowStep,
        outcome: StepOutcome,
    ) -> Result<Option<(String, AssessmentError)>> {
        match outcome {
            StepOutcome::Executed(results) => {
                let snapshot = serde_json::to_value(&results).ok();
                run.result.results.merge(results);
                run.result.executed_steps.push(step.name.clone());
                self.recovery.record_step_completed(&env.id, &step.name);
                self.recovery.create_checkpoint(
                    &env.id,
                    &step.name,
                    serde_json::json!({
                        "executedSteps": run.result.executed_steps,
                        "skippedSteps": run.result.skipped_steps,
                    }),
                    snapshot,
                );
                Ok(None)
            }
            StepOutcome::Skipped(reason) => {
                debug!(env_id = %env.id, step = %step.name, reason = %reason, "Step skipped");
                run.result.skipped_steps.push(step.name.clone());
                Ok(None)
            }
            StepOutcome::Failed(err) => {
                if err.is_security_violation() {
                    error!(env_id = %env.id, step = %step.name, "Security violation during step: {}", err);
                    return Err(err);
                }
                let recoverable = step.retries.unwrap_or(0) > 0 || step.continue_on_error;
                warn!(
                    env_id = %env.id,
                    step = %step.name,
                    recoverable,
                    "Step failed: {}",
                    err
                );
                run.result.errors.push(WorkflowError {
                    step: step.name.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                    recoverable,
                    timestamp: Utc::now(),
                });
                self.recovery.record_step_failed(&env.id, &step.name, &err);
                if recoverable {
                    Ok(None)
                } else {
                    Ok(Some((step.name.clone(), err)))
                }
            }
        }
    }

    /// Try to keep going after a non-recoverable step failure.
    async fn degrade(
        &self,
        env: &AssessmentEnvironment,
        run: &mut Run,
        failed_step: &str,
        cause: &AssessmentError,
        remaining: &[WorkflowStep],
    ) -> bool {
        let recovery = self.recovery.attempt_recovery(&env.id, cause).await;
        if !recovery.success || recovery.action != RecoveryAction::ContinuePartial {
            warn!(env_id = %env.id, step = failed_step, "No recovery: {}", recovery.message);
            return false;
        }

        let plan = self.recovery.create_degradation_plan(remaining, failed_step);
        if !plan.can_continue {
            warn!(env_id = %env.id, step = failed_step, "Degradation plan leaves nothing to run");
            return false;
        }

        info!(env_id = %env.id, reason = %plan.reason, "Continuing in degraded mode");
        run.result.degraded = true;
        run.skip.extend(plan.skipped_steps);
        for step in plan.modified_steps {
            run.overrides.insert(step.name.clone(), step);
        }
        true
    }

    fn abort_error(&self, env: &AssessmentEnvironment, run: Run, cause: AssessmentError) -> AssessmentError {
        if run.result.executed_steps.is_empty() {
            return cause;
        }
        self.recovery
            .preserve_partial_results(&env.id, run.result.results, &cause)
    }

    async fn run_cleanup(&self, env: &AssessmentEnvironment, workflow: &WorkflowDefinition, run: &mut Run) {
        for step in &workflow.cleanup {
            match self.run_step(env, step, &HashSet::new()).await {
                StepOutcome::Executed(_) => debug!(env_id = %env.id, step = %step.name, "Cleanup step done"),
                StepOutcome::Skipped(_) => {}
                StepOutcome::Failed(err) => {
                    warn!(env_id = %env.id, step = %step.name, "Cleanup step failed: {}", err);
                    run.result.errors.push(WorkflowError {
                        step: step.name.clone(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                        recoverable: true,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    /// Condition check, then up to `retries + 1` attempts with backoff.
    async fn run_step(
        &self,
        env: &AssessmentEnvironment,
        step: &WorkflowStep,
        skip: &HashSet<String>,
    ) -> StepOutcome {
        if skip.contains(&step.name) {
            return StepOutcome::Skipped("dropped by degradation plan".to_string());
        }

        let ctx = self.context(env, step);
        if let Some(condition) = &step.condition {
            match conditions::evaluate(&ctx, condition).await {
                Ok(true) => {}
                Ok(false) => {
                    return StepOutcome::Skipped(format!("condition {:?} not met", condition.kind))
                }
                Err(e) if e.is_security_violation() => return StepOutcome::Failed(e),
                Err(e) => {
                    warn!(env_id = %env.id, step = %step.name, "Condition check failed: {}", e);
                    return StepOutcome::Skipped(format!("condition check failed: {}", e));
                }
            }
        }

        let options = RetryOptions::new(RetryPolicy {
            max_attempts: step.retries.unwrap_or(0) + 1,
            ..self.backoff.clone()
        });
        let timeout = ctx.timeout;
        let outcome = with_retry(
            || {
                let ctx = &ctx;
                async move {
                    match tokio::time::timeout(timeout, self.tools.execute(ctx, step)).await {
                        Ok(result) => result,
                        Err(_) => Err(AssessmentError::Timeout(format!(
                            "step '{}' exceeded {:?}",
                            step.name, timeout
                        ))),
                    }
                }
            },
            &options,
            &step.name,
        )
        .await;

        match outcome.result {
            Ok(results) => StepOutcome::Executed(results),
            Err(e) => StepOutcome::Failed(e),
        }
    }
}
