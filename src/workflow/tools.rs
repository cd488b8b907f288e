// Tool adapter seam
//
// The orchestrator only needs "run tool X with config Y inside sandbox Z and
// give me partial results". Real analysers plug in through `ToolRegistry`;
// the built-in `command` adapter runs a shell command and accepts JSON
// results on stdout.

use super::definition::WorkflowStep;
use super::results::AnalysisResults;
use crate::sandbox::error::{AssessmentError, Result};
use crate::sandbox::runtime::{shell, shell_quote, SharedRuntime};
use crate::sandbox::types::AnalysisConfiguration;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Everything an adapter may use while running one step
#[derive(Clone)]
pub struct ToolContext {
    pub environment_id: String,
    pub container_id: String,
    pub mount_point: String,
    pub analysis_config: AnalysisConfiguration,
    pub runtime: SharedRuntime,
    pub timeout: Duration,
}

#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Identifier referenced by `WorkflowStep::tool`
    fn id(&self) -> &str;

    fn description(&self) -> &str;

    async fn run(&self, ctx: &ToolContext, step: &WorkflowStep) -> Result<AnalysisResults>;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolAdapter>>,
}

impl Default for ToolRegistry {
    /// Registry with the built-in `command` adapter.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.tools.insert(
            CommandAdapter::ID.to_string(),
            Arc::new(CommandAdapter) as Arc<dyn ToolAdapter>,
        );
        registry
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register an adapter. Fails if the id is already taken.
    pub fn register(&mut self, tool: Arc<dyn ToolAdapter>) -> Result<()> {
        let id = tool.id().to_string();
        if self.tools.contains_key(&id) {
            return Err(AssessmentError::Configuration(format!(
                "tool '{}' is already registered",
                id
            )));
        }
        self.tools.insert(id, tool);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn ToolAdapter>> {
        self.tools.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        ids.sort_unstable();
        ids
    }

    pub async fn execute(&self, ctx: &ToolContext, step: &WorkflowStep) -> Result<AnalysisResults> {
        let tool = self.tools.get(&step.tool).ok_or_else(|| {
            AssessmentError::Configuration(format!(
                "step '{}' uses unknown tool '{}'",
                step.name, step.tool
            ))
        })?;

        debug!(env_id = %ctx.environment_id, step = %step.name, tool = %step.tool, "Tool call started");
        let start = Instant::now();
        let result = tool.run(ctx, step).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(results) => info!(
                env_id = %ctx.environment_id,
                step = %step.name,
                tool = %step.tool,
                duration_ms,
                items = results.total_items(),
                status = "success",
                "Tool execution completed"
            ),
            Err(e) => info!(
                env_id = %ctx.environment_id,
                step = %step.name,
                tool = %step.tool,
                duration_ms,
                status = "failure",
                error = %e,
                "Tool execution failed"
            ),
        }
        result
    }
}

/// Runs `config.command` inside the sandbox.
///
/// Optional `config.workdir` is relative to the mount point. Stdout that
/// parses as an `AnalysisResults` JSON object is returned as the step's
/// results; any other stdout is ignored.
pub struct CommandAdapter;

impl CommandAdapter {
    pub const ID: &'static str = "command";
}

#[async_trait]
impl ToolAdapter for CommandAdapter {
    fn id(&self) -> &str {
        Self::ID
    }

    fn description(&self) -> &str {
        "Run a shell command in the sandbox"
    }

    async fn run(&self, ctx: &ToolContext, step: &WorkflowStep) -> Result<AnalysisResults> {
        let command = step
            .config
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                AssessmentError::Validation(format!("step '{}' has no command", step.name))
            })?;

        let workdir = match step.config.get("workdir").and_then(|v| v.as_str()) {
            Some(dir) => format!("{}/{}", ctx.mount_point.trim_end_matches('/'), dir.trim_start_matches('/')),
            None => ctx.mount_point.clone(),
        };
        let script = format!("cd {} && {}", shell_quote(&workdir), command);

        let output = ctx
            .runtime
            .exec(&ctx.container_id, &shell(script), ctx.timeout)
            .await?;

        if !output.success() {
            return Err(AssessmentError::WorkflowStepFailed {
                step: step.name.clone(),
                message: format!(
                    "exit code {}: {}",
                    output.exit_code,
                    tail(&output.stderr_lossy(), 500)
                ),
            });
        }

        let stdout = output.stdout_lossy();
        let trimmed = stdout.trim();
        if trimmed.starts_with('{') {
            match serde_json::from_str::<AnalysisResults>(trimmed) {
                Ok(results) => return Ok(results),
                Err(e) => debug!(step = %step.name, "stdout is not analysis JSON: {}", e),
            }
        }
        Ok(AnalysisResults::default())
    }
}

fn tail(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut start = s.len() - max_len;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::InMemoryRuntime;
    use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
    use serde_json::json;

    async fn context(runtime: Arc<InMemoryRuntime>) -> ToolContext {
        runtime
            .create_container(&ContainerSpec {
                name: "env-1".into(),
                image: "alpine".into(),
                network_mode: "none".into(),
                memory_bytes: 1,
                nano_cpus: 1,
                disk_bytes: 1,
                pids_limit: 1,
                working_dir: "/workspace".into(),
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        ToolContext {
            environment_id: "env-1".into(),
            container_id: "env-1".into(),
            mount_point: "/workspace".into(),
            analysis_config: AnalysisConfiguration::default(),
            runtime,
            timeout: Duration::from_secs(5),
        }
    }

    fn command_step(command: &str) -> WorkflowStep {
        let mut step = WorkflowStep {
            name: "scan".into(),
            tool: "command".into(),
            ..Default::default()
        };
        step.config.insert("command".into(), json!(command));
        step
    }

    #[tokio::test]
    async fn test_command_adapter_parses_json_stdout() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_exec_handler(|_, _| ExecOutput {
            stdout: br#"{"recommendations": [{"title": "pin deps"}]}"#.to_vec(),
            ..Default::default()
        });
        let ctx = context(runtime).await;

        let results = ToolRegistry::default()
            .execute(&ctx, &command_step("scanner --json"))
            .await
            .unwrap();
        assert_eq!(results.recommendations[0].title, "pin deps");
    }

    #[tokio::test]
    async fn test_command_adapter_runs_in_workdir() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        runtime.set_exec_handler(move |_, cmd| {
            *sink.lock().unwrap() = cmd.join(" ");
            ExecOutput::default()
        });
        let ctx = context(runtime).await;

        let mut step = command_step("make lint");
        step.config.insert("workdir".into(), json!("pkg"));
        let results = CommandAdapter.run(&ctx, &step).await.unwrap();

        assert!(results.is_empty());
        assert!(seen.lock().unwrap().contains("cd '/workspace/pkg' && make lint"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_step() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_exec_handler(|_, _| ExecOutput {
            exit_code: 2,
            stderr: b"boom".to_vec(),
            ..Default::default()
        });
        let ctx = context(runtime).await;

        let err = CommandAdapter.run(&ctx, &command_step("false")).await.unwrap_err();
        assert!(matches!(err, AssessmentError::WorkflowStepFailed { .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_tools() {
        let mut registry = ToolRegistry::default();
        assert!(registry.register(Arc::new(CommandAdapter)).is_err());
        assert_eq!(registry.ids(), vec!["command"]);
    }
}
