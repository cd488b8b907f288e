// Environment lifecycle manager - creates, mounts into, tracks and destroys
// assessment environments

use super::alerts::{AlertBus, AlertKind};
use super::error::{AssessmentError, ErrorSeverity, Result, ViolationKind};
use super::gatekeeper::{GatekeeperSettings, ResourceGatekeeper};
use super::network_monitor::{MonitorSettings, NetworkMonitor};
use super::runtime::{shell, shell_quote, ContainerSpec, SharedRuntime};
use super::scanner::{source_files, CodeScanner};
use super::security::{
    degraded_limits, validate_allowed_hosts, validate_resource_limits, validate_security_config,
    SecurityPolicyEngine,
};
use super::types::{
    AnalysisConfiguration, AssessmentEnvironment, CodebaseType, EnvironmentStatus, ParsedLimits,
    ResourceLimits, SecurityConfiguration,
};
use crate::resilience::{
    with_retry, CircuitBreaker, CircuitBreakerSettings, RecoveryAction, RecoveryManager,
    RetryOptions, RetryPolicies, DEFAULT_MAX_RECOVERY_ATTEMPTS,
};
use crate::workflow::AnalysisResults;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sandbox directories code may never be mounted onto
const PROTECTED_DESTINATIONS: [&str; 14] = [
    "/", "/bin", "/boot", "/dev", "/etc", "/lib", "/lib64", "/proc", "/root", "/run", "/sbin",
    "/sys", "/usr", "/var/run",
];

const PERMISSION_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle settings, the `environment` section of the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvironmentSettings {
    /// Extra host directories code may be mounted from. The temp dir, the
    /// current directory and `workspace_root` are always allowed.
    pub allowed_source_roots: Vec<PathBuf>,
    pub workspace_root: Option<PathBuf>,
    /// Where code lands inside the sandbox
    pub mount_point: String,
    pub base_images: HashMap<CodebaseType, String>,
    pub stop_timeout_secs: u64,
    pub pids_limit: u64,
    pub max_recovery_attempts: u32,
    /// Submit the disk cap as a Docker storage option (needs a driver with
    /// quota support)
    pub storage_quota: bool,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        let base_images = HashMap::from([
            (CodebaseType::Node, "node:20-bookworm-slim".to_string()),
            (CodebaseType::Python, "python:3.12-slim".to_string()),
            (CodebaseType::Rust, "rust:1-slim".to_string()),
            (CodebaseType::Go, "golang:1.22-bookworm".to_string()),
            (CodebaseType::Java, "eclipse-temurin:21-jdk".to_string()),
            (CodebaseType::Generic, "ubuntu:22.04".to_string()),
        ]);
        Self {
            allowed_source_roots: Vec::new(),
            workspace_root: None,
            mount_point: "/workspace".to_string(),
            base_images,
            stop_timeout_secs: 10,
            pids_limit: 256,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            storage_quota: false,
        }
    }
}

impl EnvironmentSettings {
    pub fn base_image(&self, codebase_type: CodebaseType) -> String {
        self.base_images
            .get(&codebase_type)
            .or_else(|| self.base_images.get(&CodebaseType::Generic))
            .cloned()
            .unwrap_or_else(|| "ubuntu:22.04".to_string())
    }

    /// Canonical host roots code may be mounted from.
    pub fn source_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![std::env::temp_dir()];
        if let Ok(cwd) = std::env::current_dir() {
            roots.push(cwd);
        }
        roots.extend(self.workspace_root.iter().cloned());
        roots.extend(self.allowed_source_roots.iter().cloned());
        roots
            .into_iter()
            .filter_map(|root| root.canonicalize().ok())
            .collect()
    }
}

/// Everything the manager needs besides the runtime
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    pub environment: EnvironmentSettings,
    pub retry: RetryPolicies,
    pub circuit_breaker: CircuitBreakerSettings,
    pub monitor: MonitorSettings,
    pub gatekeeper: GatekeeperSettings,
}

/// Result of copying a codebase into a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountReport {
    pub destination: String,
    pub files: usize,
    pub bytes: u64,
}

/// Environment lifecycle manager
///
/// Owns every environment record and drives the state machine
/// `creating -> ready -> analyzing -> completed`, with `failed` reachable
/// from anywhere. Container creation goes through a circuit breaker and
/// the `containerCreation` retry policy, and failed creations are offered
/// to the recovery manager. Any security violation detected here ends in
/// emergency termination.
pub struct EnvironmentManager {
    runtime: SharedRuntime,
    settings: EnvironmentSettings,
    retry: RetryPolicies,
    breaker: CircuitBreaker,
    policy: SecurityPolicyEngine,
    alerts: Arc<AlertBus>,
    recovery: Arc<RecoveryManager>,
    monitor: NetworkMonitor,
    gatekeeper: ResourceGatekeeper,
    scanner: CodeScanner,
    environments: DashMap<String, AssessmentEnvironment>,
}

impl EnvironmentManager {
    pub fn new(runtime: SharedRuntime, options: ManagerOptions) -> Result<Self> {
        let alerts = Arc::new(AlertBus::new());
        let recovery = Arc::new(RecoveryManager::new(options.environment.max_recovery_attempts));
        Ok(Self {
            policy: SecurityPolicyEngine::new(runtime.clone(), alerts.clone(), options.retry.clone()),
            monitor: NetworkMonitor::new(runtime.clone(), &options.monitor, Some(alerts.clone())),
            gatekeeper: ResourceGatekeeper::new(runtime.clone(), options.gatekeeper),
            breaker: CircuitBreaker::from_settings("container-runtime", &options.circuit_breaker),
            scanner: CodeScanner::new()?,
            retry: options.retry,
            settings: options.environment,
            environments: DashMap::new(),
            runtime,
            alerts,
            recovery,
        })
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.runtime
    }

    pub fn settings(&self) -> &EnvironmentSettings {
        &self.settings
    }

    pub fn alerts(&self) -> &Arc<AlertBus> {
        &self.alerts
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn gatekeeper(&self) -> &ResourceGatekeeper {
        &self.gatekeeper
    }

    pub fn policy(&self) -> &SecurityPolicyEngine {
        &self.policy
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create and start a locked-down sandbox for one assessment.
    ///
    /// The returned environment is `ready`. On failure the partially
    /// created container is removed and the record is left as `failed`.
    pub async fn create_environment(
        &self,
        security: SecurityConfiguration,
        analysis: AnalysisConfiguration,
    ) -> Result<AssessmentEnvironment> {
        validate_security_config(&security)?;
        let limits = validate_resource_limits(&security.resource_limits)?;
        validate_allowed_hosts(&security.allowed_network_access)?;

        let id = format!("isolab-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let env = AssessmentEnvironment::new(id.clone(), security.clone(), analysis.clone());
        self.environments.insert(id.clone(), env);
        info!(
            env_id = %id,
            codebase = %analysis.codebase_type,
            isolated = security.network_isolation,
            "Creating assessment environment"
        );

        self.recovery.create_checkpoint(
            &id,
            "environment-create:before",
            serde_json::json!({
                "securityConfig": security,
                "analysisConfig": analysis,
            }),
            None,
        );

        match self.provision(&id, &security, &analysis, limits).await {
            Ok(applied) => {
                self.recovery.create_checkpoint(
                    &id,
                    "environment-create:after",
                    serde_json::json!({ "containerId": id }),
                    Some(serde_json::json!({
                        "cpu": applied.cpu,
                        "memoryBytes": applied.memory_bytes,
                        "diskBytes": applied.disk_bytes,
                    })),
                );
                let env = self.update(&id, |env| env.transition(EnvironmentStatus::Ready))?;
                info!(env_id = %id, "Environment ready");
                Ok(env)
            }
            Err(e) if e.is_security_violation() => {
                self.emergency_terminate(&id, &e).await;
                Err(e)
            }
            Err(e) => {
                error!(env_id = %id, code = e.code(), "Environment creation failed: {}", e);
                self.teardown(&id).await;
                self.mark_failed(&id, &e);
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        id: &str,
        security: &SecurityConfiguration,
        analysis: &AnalysisConfiguration,
        requested: ParsedLimits,
    ) -> Result<ParsedLimits> {
        let image = self.settings.base_image(analysis.codebase_type);
        self.gatekeeper.ensure_image(&image).await?;

        let options = RetryOptions::new(self.retry.container_creation.clone()).on_retry(
            |attempt, error, delay| {
                warn!(attempt, delay_ms = delay.as_millis() as u64, "Container creation retry: {}", error)
            },
        );

        let mut limits = requested;
        loop {
            let spec = self.container_spec(id, &image, security, analysis, &limits);
            let created = self
                .breaker
                .call(|| async {
                    with_retry(|| self.create_and_start(&spec), &options, "create_container")
                        .await
                        .into_result()
                })
                .await;

            let error = match created {
                Ok(()) => break,
                Err(e) => e,
            };
            if error.is_security_violation() {
                return Err(error);
            }

            let recovery = self.recovery.attempt_recovery(id, &error).await;
            if !recovery.success {
                return Err(error);
            }
            match recovery.action {
                RecoveryAction::RecreateContainer => {
                    info!(env_id = %id, "Recreating container: {}", recovery.message);
                }
                RecoveryAction::ReduceResources => {
                    limits = degraded_limits(&limits);
                    info!(
                        env_id = %id,
                        cpu = limits.cpu,
                        memory_bytes = limits.memory_bytes,
                        "Retrying creation with reduced resources"
                    );
                }
                _ => return Err(error),
            }
            self.remove_quietly(id).await;
        }

        self.policy.apply_network_isolation(id, security).await?;
        let wanted = if limits == requested {
            security.resource_limits.clone()
        } else {
            ResourceLimits::from_parsed(&limits)
        };
        let applied = self.policy.set_resource_limits(id, &wanted).await?;
        self.policy
            .configure_filesystem_access(id, &security.filesystem_access)
            .await?;

        if !security.network_isolation || !security.allowed_network_access.is_empty() {
            self.monitor.start_monitoring(id);
        }
        Ok(applied.limits)
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<()> {
        let id = self.runtime.create_container(spec).await?;
        if let Err(e) = self.runtime.start_container(&id).await {
            self.remove_quietly(&id).await;
            return Err(e);
        }
        Ok(())
    }

    fn container_spec(
        &self,
        id: &str,
        image: &str,
        security: &SecurityConfiguration,
        analysis: &AnalysisConfiguration,
        limits: &ParsedLimits,
    ) -> ContainerSpec {
        let labels = HashMap::from([
            ("isolab.environment".to_string(), id.to_string()),
            (
                "isolab.codebase".to_string(),
                analysis.codebase_type.as_str().to_string(),
            ),
        ]);
        ContainerSpec {
            name: id.to_string(),
            image: image.to_string(),
            network_mode: if security.network_isolation { "none" } else { "bridge" }.to_string(),
            memory_bytes: limits.memory_bytes,
            nano_cpus: (limits.cpu * 1e9) as u64,
            disk_bytes: limits.disk_bytes,
            pids_limit: self.settings.pids_limit,
            working_dir: self.settings.mount_point.clone(),
            labels,
        }
    }

    // ------------------------------------------------------------------
    // Mounting
    // ------------------------------------------------------------------

    /// Copy `source` from the host into the sandbox at `destination`.
    ///
    /// The source must live under an allowed root, the destination must not
    /// be a system directory, and the tree must be free of high-risk
    /// signatures. Violations terminate the environment.
    pub async fn mount_codebase(&self, id: &str, source: &Path, destination: &str) -> Result<MountReport> {
        let env = self.get(id)?;
        if env.status != EnvironmentStatus::Ready {
            return Err(AssessmentError::Validation(format!(
                "environment {} is {}, not ready",
                id, env.status
            )));
        }

        let checked = self
            .check_source(source)
            .and_then(|root| check_destination(destination).map(|dest| (root, dest)));
        let (root, destination) = match checked {
            Ok(paths) => paths,
            Err(e) if e.is_security_violation() => return Err(self.violation_detected(id, e).await),
            Err(e) => return Err(e),
        };

        let findings = self.scanner.scan_tree(&root)?;
        if let Some(first) = findings.first() {
            warn!(env_id = %id, count = findings.len(), "High-risk signatures found in codebase");
            let e = AssessmentError::violation(
                ViolationKind::MaliciousCode,
                format!("{} ({} file(s) flagged)", first, findings.len()),
            );
            return Err(self.violation_detected(id, e).await);
        }

        let mut report = MountReport {
            destination: destination.clone(),
            files: 0,
            bytes: 0,
        };
        for path in source_files(&root)? {
            // symlinks that escape the tree are not followed
            let resolved = path.canonicalize()?;
            if !resolved.starts_with(&root) {
                warn!(env_id = %id, path = %path.display(), "Skipping link outside source tree");
                continue;
            }
            let relative = path.strip_prefix(&root).unwrap_or(&path);
            let target = format!(
                "{}/{}",
                destination.trim_end_matches('/'),
                relative.to_string_lossy().replace('\\', "/")
            );
            let contents = tokio::fs::read(&resolved).await?;
            report.bytes += contents.len() as u64;
            self.runtime.upload_file(id, &target, contents).await?;
            report.files += 1;
        }

        if let Err(e) = self.check_mounted_permissions(id, &destination).await {
            if e.is_security_violation() {
                return Err(self.violation_detected(id, e).await);
            }
            return Err(e);
        }

        self.recovery.create_checkpoint(
            id,
            "mount-codebase",
            serde_json::json!({
                "source": root.to_string_lossy(),
                "destination": destination,
            }),
            Some(serde_json::json!({ "files": report.files, "bytes": report.bytes })),
        );
        info!(env_id = %id, files = report.files, bytes = report.bytes, "Codebase mounted");
        Ok(report)
    }

    fn check_source(&self, source: &Path) -> Result<PathBuf> {
        let resolved = source.canonicalize().map_err(|e| {
            AssessmentError::Validation(format!("source {} is not accessible: {}", source.display(), e))
        })?;
        if !resolved.is_dir() {
            return Err(AssessmentError::Validation(format!(
                "source {} is not a directory",
                source.display()
            )));
        }
        if self
            .settings
            .source_roots()
            .iter()
            .any(|root| resolved.starts_with(root))
        {
            Ok(resolved)
        } else {
            Err(AssessmentError::violation(
                ViolationKind::Filesystem,
                format!("source {} is outside the allowed directories", resolved.display()),
            ))
        }
    }

    async fn check_mounted_permissions(&self, id: &str, destination: &str) -> Result<()> {
        let script = format!(
            "find {} -xdev -type f -perm /6000 2>/dev/null | head -n 20",
            shell_quote(destination)
        );
        let output = self
            .runtime
            .exec(id, &shell(script), PERMISSION_CHECK_TIMEOUT)
            .await?;
        let flagged: Vec<String> = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if flagged.is_empty() {
            return Ok(());
        }
        Err(AssessmentError::violation(
            ViolationKind::PrivilegeEscalation,
            format!("setuid/setgid files in mounted code: {}", flagged.join(", ")),
        ))
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    async fn violation_detected(&self, id: &str, violation: AssessmentError) -> AssessmentError {
        self.emergency_terminate(id, &violation).await;
        violation
    }

    /// Kill and force-remove the sandbox immediately, skipping graceful
    /// shutdown, and raise an alert.
    pub async fn emergency_terminate(&self, id: &str, reason: &AssessmentError) {
        error!(env_id = %id, code = reason.code(), "Emergency termination: {}", reason);
        if let AssessmentError::SecurityViolation { kind, message } = reason {
            self.alerts.violation(id, *kind, message.clone());
        }
        self.alerts.raise(
            id,
            AlertKind::EmergencyTermination,
            ErrorSeverity::Critical,
            reason.to_string(),
        );

        if let Err(e) = self.runtime.kill_container(id).await {
            warn!(env_id = %id, "Kill failed: {}", e);
        }
        if let Err(e) = self.runtime.remove_container(id, true).await {
            warn!(env_id = %id, "Forced removal failed: {}", e);
        }
        self.monitor.stop_monitoring(id).await;
        self.policy.cleanup(id).await;
        self.mark_failed(id, reason);
    }

    /// Stop (or kill), remove and forget an environment.
    ///
    /// Bookkeeping is always cleared, so destroying twice is safe. Container
    /// removal errors are reported after cleanup has run.
    pub async fn destroy_environment(&self, id: &str) -> Result<()> {
        if !self.environments.contains_key(id) {
            debug!(env_id = %id, "Destroy of unknown environment ignored");
            return Ok(());
        }
        info!(env_id = %id, "Destroying environment");

        self.monitor.stop_monitoring(id).await;

        let timeout = Duration::from_secs(self.settings.stop_timeout_secs);
        if let Err(e) = self.runtime.stop_container(id, timeout).await {
            warn!(env_id = %id, "Graceful stop failed, killing: {}", e);
            if let Err(e) = self.runtime.kill_container(id).await {
                debug!(env_id = %id, "Kill failed: {}", e);
            }
        }
        let removed = match self.runtime.remove_container(id, true).await {
            Ok(()) | Err(AssessmentError::NotFound(_)) => Ok(()),
            Err(e) => Err(AssessmentError::ContainerDestroy(format!("{}: {}", id, e))),
        };

        self.policy.cleanup(id).await;
        self.recovery.clear(id);
        self.environments.remove(id);
        removed
    }

    async fn teardown(&self, id: &str) {
        self.monitor.stop_monitoring(id).await;
        self.remove_quietly(id).await;
        self.policy.cleanup(id).await;
    }

    async fn remove_quietly(&self, id: &str) {
        match self.runtime.remove_container(id, true).await {
            Ok(()) | Err(AssessmentError::NotFound(_)) => {}
            Err(e) => warn!(env_id = %id, "Failed to remove container: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    fn update<F>(&self, id: &str, f: F) -> Result<AssessmentEnvironment>
    where
        F: FnOnce(&mut AssessmentEnvironment) -> Result<()>,
    {
        let mut entry = self
            .environments
            .get_mut(id)
            .ok_or_else(|| AssessmentError::NotFound(id.to_string()))?;
        f(entry.value_mut())?;
        Ok(entry.clone())
    }

    fn mark_failed(&self, id: &str, reason: &AssessmentError) {
        if let Some(mut env) = self.environments.get_mut(id) {
            if env.status != EnvironmentStatus::Failed {
                env.status = EnvironmentStatus::Failed;
                env.completed_at = Some(chrono::Utc::now());
            }
            env.error = Some(reason.to_string());
        }
    }

    pub fn get(&self, id: &str) -> Result<AssessmentEnvironment> {
        self.environments
            .get(id)
            .map(|env| env.clone())
            .ok_or_else(|| AssessmentError::NotFound(id.to_string()))
    }

    pub fn status(&self, id: &str) -> Result<EnvironmentStatus> {
        self.get(id).map(|env| env.status)
    }

    /// All tracked environments, oldest first
    pub fn list(&self) -> Vec<AssessmentEnvironment> {
        let mut all: Vec<AssessmentEnvironment> =
            self.environments.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|env| env.created_at);
        all
    }

    pub fn begin_analysis(&self, id: &str) -> Result<AssessmentEnvironment> {
        self.update(id, |env| env.transition(EnvironmentStatus::Analyzing))
    }

    pub fn complete_analysis(&self, id: &str, results: AnalysisResults) -> Result<AssessmentEnvironment> {
        self.update(id, |env| {
            env.transition(EnvironmentStatus::Completed)?;
            env.results = Some(results);
            Ok(())
        })
    }

    pub fn fail_analysis(&self, id: &str, error: &AssessmentError) -> Result<AssessmentEnvironment> {
        self.update(id, |env| {
            env.transition(EnvironmentStatus::Failed)?;
            env.error = Some(error.to_string());
            if let AssessmentError::PartialAnalysis(partial) = error {
                env.results = Some(partial.partial_results.clone());
            }
            Ok(())
        })
    }

    /// Whether the live sandbox still matches `config`.
    pub async fn validate_security_boundaries(&self, id: &str, config: &SecurityConfiguration) -> Result<bool> {
        self.get(id)?;
        let report = self.policy.validate_boundaries(id, config).await?;
        if !report.passed {
            for failure in &report.failures {
                warn!(env_id = %id, "Boundary check failed: {}", failure);
            }
        }
        Ok(report.passed)
    }
}

/// Normalise a sandbox destination and reject system directories.
fn check_destination(destination: &str) -> Result<String> {
    let path = Path::new(destination);
    let violation = |why: &str| {
        AssessmentError::violation(
            ViolationKind::Filesystem,
            format!("destination {} {}", destination, why),
        )
    };
    if !path.is_absolute() {
        return Err(violation("is not absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(violation("contains '..'"));
    }
    let normalised = format!("/{}", destination.trim_matches('/'));
    for protected in PROTECTED_DESTINATIONS {
        let hit = if protected == "/" {
            normalised == "/"
        } else {
            normalised == protected || normalised.starts_with(&format!("{}/", protected))
        };
        if hit {
            return Err(violation("targets a system directory"));
        }
    }
    Ok(normalised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryPolicy;
    use crate::sandbox::memory::InMemoryRuntime;
    use crate::sandbox::runtime::ExecOutput;
    use tempfile::TempDir;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
            jitter_ms: 0,
        }
    }

    fn options() -> ManagerOptions {
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

    fn manager() -> (Arc<InMemoryRuntime>, EnvironmentManager) {
        let runtime = Arc::new(InMemoryRuntime::new());
        let manager = EnvironmentManager::new(runtime.clone(), options()).unwrap();
        (runtime, manager)
    }

    #[test]
    fn test_destination_checks() {
        assert_eq!(check_destination("/workspace/").unwrap(), "/workspace");
        assert_eq!(check_destination("/opt/code").unwrap(), "/opt/code");
        assert!(check_destination("/").is_err());
        assert!(check_destination("/etc").is_err());
        assert!(check_destination("/usr/local/src").is_err());
        assert!(check_destination("/workspace/../etc").is_err());
        assert!(check_destination("workspace").is_err());
        // prefix, not a child
        assert!(check_destination("/etcetera").is_ok());
    }

    #[tokio::test]
    async fn test_create_ready_and_destroy() {
        let (runtime, manager) = manager();
        let env = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap();

        assert_eq!(env.status, EnvironmentStatus::Ready);
        let spec = runtime.container_spec(&env.id).unwrap();
        assert_eq!(spec.network_mode, "none");
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.image, "ubuntu:22.04");
        assert!(!manager.monitor().is_monitoring(&env.id));

        let checkpoints = manager.recovery().checkpoints(&env.id);
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[1].step_name, "environment-create:after");

        assert!(manager
            .validate_security_boundaries(&env.id, &SecurityConfiguration::default())
            .await
            .unwrap());

        manager.destroy_environment(&env.id).await.unwrap();
        manager.destroy_environment(&env.id).await.unwrap();
        assert!(manager.list().is_empty());
        assert!(!runtime.container_exists(&env.id));
    }

    #[tokio::test]
    async fn test_transient_create_failure_is_retried() {
        let (runtime, manager) = manager();
        runtime.fail_next("create", 1);

        let env = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap();
        assert_eq!(env.status, EnvironmentStatus::Ready);
        assert_eq!(runtime.call_count("create"), 2);
    }

    #[tokio::test]
    async fn test_exhausted_creation_recreates_then_fails() {
        let (runtime, manager) = manager();
        runtime.fail_next("create", 100);

        let err = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONTAINER_CREATION_FAILED");

        // 2 attempts per round, 3 recreations before recovery gives up
        assert_eq!(runtime.call_count("create"), 8);
        let envs = manager.list();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].status, EnvironmentStatus::Failed);
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_bounds_limits_rejected_before_runtime() {
        let (runtime, manager) = manager();
        let mut security = SecurityConfiguration::default();
        security.resource_limits.memory = "16g".into();

        let err = manager
            .create_environment(security, AnalysisConfiguration::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RESOURCE_ALLOCATION_FAILED");
        assert!(runtime.calls().is_empty());
        assert!(manager.list().is_empty());
    }

    #[tokio::test]
    async fn test_mount_uploads_and_checkpoints() {
        let (runtime, manager) = manager();
        let env = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("src/index.js"), "console.log(1)\n").unwrap();

        let report = manager
            .mount_codebase(&env.id, dir.path(), "/workspace")
            .await
            .unwrap();
        assert_eq!(report.files, 2);
        let mut files = runtime.files(&env.id);
        files.sort();
        assert_eq!(files, vec!["/workspace/package.json", "/workspace/src/index.js"]);
        assert_eq!(
            manager.recovery().last_checkpoint(&env.id).unwrap().step_name,
            "mount-codebase"
        );
    }

    #[tokio::test]
    async fn test_setuid_file_terminates_environment() {
        let (runtime, manager) = manager();
        let env = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap();
        runtime.set_exec_handler(|_, cmd| ExecOutput {
            stdout: if cmd[2].contains("-perm /6000") {
                b"/workspace/bin/escalate\n".to_vec()
            } else {
                Vec::new()
            },
            ..Default::default()
        });

        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("main.c"), "int main() { return 0; }\n").unwrap();

        let err = manager
            .mount_codebase(&env.id, dir.path(), "/workspace")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PRIVILEGE_ESCALATION");
        assert_eq!(manager.status(&env.id).unwrap(), EnvironmentStatus::Failed);
        assert_eq!(runtime.call_count("kill"), 1);
        assert!(!runtime.container_exists(&env.id));
    }

    #[tokio::test]
    async fn test_open_network_starts_monitor() {
        let (_runtime, manager) = manager();
        let security = SecurityConfiguration {
            network_isolation: false,
            ..Default::default()
        };
        let env = manager
            .create_environment(security, AnalysisConfiguration::default())
            .await
            .unwrap();
        assert!(manager.monitor().is_monitoring(&env.id));

        manager.destroy_environment(&env.id).await.unwrap();
        assert!(!manager.monitor().is_monitoring(&env.id));
    }

    #[tokio::test]
    async fn test_analysis_transitions() {
        let (_runtime, manager) = manager();
        let env = manager
            .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
            .await
            .unwrap();

        assert!(manager
            .complete_analysis(&env.id, AnalysisResults::default())
            .is_err());
        manager.begin_analysis(&env.id).unwrap();
        let done = manager
            .complete_analysis(&env.id, AnalysisResults::default())
            .unwrap();
        assert_eq!(done.status, EnvironmentStatus::Completed);
        assert!(done.completed_at.is_some());
    }
}
