//! Public operations surface.
//!
//! `AssessmentService` ties the environment manager, the workflow catalog
//! and the orchestrator together behind the handful of calls the CLI and
//! report writers need.

use crate::sandbox::{
    AnalysisConfiguration, AssessmentEnvironment, AssessmentError, DownloadOutcome,
    DownloadRequest, EnvironmentManager, EnvironmentStatus, InstallReport, ManagerOptions,
    MountReport, PackageManager, Result, SecurityAlert, SecurityConfiguration, SharedRuntime,
};
use crate::workflow::{
    ToolRegistry, WorkflowCatalog, WorkflowDefinition, WorkflowOrchestrator, WorkflowResult,
    WorkflowSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub struct AssessmentService {
    manager: Arc<EnvironmentManager>,
    catalog: WorkflowCatalog,
    orchestrator: WorkflowOrchestrator,
}

impl AssessmentService {
    /// Service with the built-in tool adapters.
    pub fn new(runtime: SharedRuntime, options: ManagerOptions, workflows_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::with_tools(runtime, options, workflows_dir, ToolRegistry::default())
    }

    pub fn with_tools(
        runtime: SharedRuntime,
        options: ManagerOptions,
        workflows_dir: impl Into<PathBuf>,
        tools: ToolRegistry,
    ) -> Result<Self> {
        let backoff = options.retry.analysis_execution.clone();
        let mount_point = options.environment.mount_point.clone();
        let manager = Arc::new(EnvironmentManager::new(runtime.clone(), options)?);
        let orchestrator = WorkflowOrchestrator::new(
            runtime,
            Arc::new(tools),
            manager.recovery().clone(),
            backoff,
            mount_point,
        );
        Ok(Self {
            manager,
            catalog: WorkflowCatalog::new(workflows_dir),
            orchestrator,
        })
    }

    pub fn manager(&self) -> &Arc<EnvironmentManager> {
        &self.manager
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SecurityAlert> {
        self.manager.alerts().subscribe()
    }

    pub async fn create_environment(
        &self,
        security: SecurityConfiguration,
        analysis: AnalysisConfiguration,
    ) -> Result<AssessmentEnvironment> {
        self.manager.create_environment(security, analysis).await
    }

    pub async fn mount_codebase(&self, id: &str, source: &Path, destination: Option<&str>) -> Result<MountReport> {
        let destination = destination.unwrap_or(&self.manager.settings().mount_point);
        self.manager.mount_codebase(id, source, destination).await
    }

    /// Load a workflow by name (from the catalog directory) or by path and
    /// run it against `id`.
    pub async fn execute_workflow(&self, id: &str, workflow: &str) -> Result<WorkflowResult> {
        let definition = self.catalog.load(workflow)?;
        self.execute_definition(id, &definition).await
    }

    pub async fn execute_definition(&self, id: &str, definition: &WorkflowDefinition) -> Result<WorkflowResult> {
        let env = self.manager.get(id)?;
        if !definition.supports(env.analysis_config.codebase_type) {
            return Err(AssessmentError::Validation(format!(
                "workflow '{}' does not support {} codebases",
                definition.name, env.analysis_config.codebase_type
            )));
        }

        let env = self.manager.begin_analysis(id)?;
        match self.orchestrator.execute(&env, definition).await {
            Ok(result) => {
                self.manager.complete_analysis(id, result.results.clone())?;
                info!(
                    env_id = %id,
                    workflow = %definition.name,
                    success = result.success,
                    executed = result.executed_steps.len(),
                    skipped = result.skipped_steps.len(),
                    "Workflow finished"
                );
                Ok(result)
            }
            Err(e) => {
                if e.is_security_violation() {
                    self.manager.emergency_terminate(id, &e).await;
                } else if let Err(state_err) = self.manager.fail_analysis(id, &e) {
                    warn!(env_id = %id, "Could not record failure: {}", state_err);
                }
                Err(e)
            }
        }
    }

    pub async fn validate_security_boundaries(&self, id: &str, config: &SecurityConfiguration) -> Result<bool> {
        self.manager.validate_security_boundaries(id, config).await
    }

    pub async fn install_dependencies(
        &self,
        id: &str,
        package_manager: PackageManager,
        packages: &[String],
    ) -> Result<InstallReport> {
        self.manager.get(id)?;
        let workdir = &self.manager.settings().mount_point;
        self.manager
            .gatekeeper()
            .install_dependencies(id, workdir, package_manager, packages)
            .await
    }

    pub async fn download(&self, id: &str, request: &DownloadRequest) -> Result<DownloadOutcome> {
        self.manager.get(id)?;
        self.manager.gatekeeper().download(id, request).await
    }

    pub async fn destroy_environment(&self, id: &str) -> Result<()> {
        self.manager.destroy_environment(id).await
    }

    pub fn list_environments(&self) -> Vec<AssessmentEnvironment> {
        self.manager.list()
    }

    pub fn status(&self, id: &str) -> Result<EnvironmentStatus> {
        self.manager.status(id)
    }

    pub fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        self.catalog.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{RetryPolicies, RetryPolicy};
    use crate::sandbox::{CodebaseType, InMemoryRuntime};
    use crate::sandbox::runtime::ExecOutput;
    use crate::workflow::WorkflowStep;
    use tempfile::TempDir;

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
            jitter_ms: 0,
        }
    }

    fn service(dir: &Path) -> (Arc<InMemoryRuntime>, AssessmentService) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let options = ManagerOptions {
            retry: RetryPolicies {
                container_creation: quick(),
                resource_allocation: quick(),
                network_operation: quick(),
                analysis_execution: quick(),
            },
            ..Default::default()
        };
        let service = AssessmentService::new(runtime.clone(), options, dir).unwrap();
        (runtime, service)
    }

    fn command_step(name: &str, command: &str) -> WorkflowStep {
        let mut config = serde_json::Map::new();
        config.insert("command".into(), serde_json::Value::String(command.into()));
        WorkflowStep {
            name: name.into(),
            description: String::new(),
            tool: "command".into(),
            config,
            condition: None,
            timeout: None,
            retries: None,
            continue_on_error: false,
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            name: "audit".into(),
            description: String::new(),
            version: "1.0.0".into(),
            codebase_types: vec![CodebaseType::Node],
            steps: vec![command_step("scan", "true")],
            parallel_steps: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_named_workflow_completes_environment() {
        let dir = TempDir::new().unwrap();
        let (runtime, service) = service(dir.path());
        service.catalog().save(&definition(), None).unwrap();
        runtime.set_exec_handler(|_, cmd| ExecOutput {
            stdout: if cmd[2].ends_with("&& true") {
                br#"{"recommendations":[{"title":"Pin dependencies","description":"","priority":"low"}]}"#
                    .to_vec()
            } else {
                Vec::new()
            },
            ..Default::default()
        });

        let analysis = AnalysisConfiguration {
            codebase_type: CodebaseType::Node,
            ..Default::default()
        };
        let env = service
            .create_environment(SecurityConfiguration::default(), analysis)
            .await
            .unwrap();
        let result = service.execute_workflow(&env.id, "audit").await.unwrap();

        assert!(result.success);
        assert_eq!(result.results.recommendations.len(), 1);
        assert_eq!(result.executed_steps, vec!["scan".to_string()]);
        assert_eq!(service.status(&env.id).unwrap(), EnvironmentStatus::Completed);
        assert_eq!(service.list_workflows().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_codebase_rejected_before_analysis() {
        let dir = TempDir::new().unwrap();
        let (_runtime, service) = service(dir.path());
        let analysis = AnalysisConfiguration {
            codebase_type: CodebaseType::Python,
            ..Default::default()
        };
        let env = service
            .create_environment(SecurityConfiguration::default(), analysis)
            .await
            .unwrap();

        let err = service
            .execute_definition(&env.id, &definition())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(service.status(&env.id).unwrap(), EnvironmentStatus::Ready);
    }

    #[tokio::test]
    async fn test_operations_on_unknown_environment() {
        let dir = TempDir::new().unwrap();
        let (_runtime, service) = service(dir.path());
        assert_eq!(service.status("missing").unwrap_err().code(), "ENVIRONMENT_NOT_FOUND");
        assert!(service
            .install_dependencies("missing", PackageManager::Npm, &["lodash".into()])
            .await
            .is_err());
        service.destroy_environment("missing").await.unwrap();
    }
}
