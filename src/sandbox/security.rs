// Security policy engine
//
// Computes and applies network isolation, resource caps and filesystem
// permissions for a sandbox, and checks afterwards that the policy holds.

use super::alerts::AlertBus;
use super::error::{AssessmentError, Result, ViolationKind};
use super::runtime::{shell, shell_quote, NetworkSpec, ResourceUpdate, SharedRuntime};
use super::types::{parse_size, FilesystemAccess, ParsedLimits, ResourceLimits, SecurityConfiguration};
use crate::resilience::{with_retry, RetryOptions, RetryPolicies};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MIN_MEMORY_BYTES: u64 = 64 * 1024 * 1024;
pub const MAX_MEMORY_BYTES: u64 = 8 * 1024 * 1024 * 1024;
pub const MIN_CPU: f64 = 0.1;
pub const MAX_CPU: f64 = 4.0;
pub const MIN_DISK_BYTES: u64 = 64 * 1024 * 1024;
pub const MAX_ALLOWED_HOSTS: usize = 100;

/// Share of host capacity a single sandbox may claim
const HOST_CAPACITY_FRACTION: f64 = 0.8;

/// Write access is removed from these in every sandbox
pub const SYSTEM_PATHS: [&str; 5] = ["/etc", "/usr", "/bin", "/sbin", "/lib"];

const FS_TIMEOUT: Duration = Duration::from_secs(60);

/// Exit code used by permission scripts when the path is absent
const MISSING_PATH_EXIT: i64 = 44;

/// Outcome of [`SecurityPolicyEngine::set_resource_limits`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedLimits {
    pub limits: ParsedLimits,
    pub degraded: bool,
}

/// Result of a live boundary check
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundaryReport {
    pub passed: bool,
    pub failures: Vec<String>,
}

/// Structural pre-flight check: resource limits present and non-empty.
pub fn validate_security_config(config: &SecurityConfiguration) -> Result<()> {
    let limits = &config.resource_limits;
    let missing: Vec<&str> = [
        ("cpu", &limits.cpu),
        ("memory", &limits.memory),
        ("diskSpace", &limits.disk_space),
    ]
    .iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| *name)
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AssessmentError::Validation(format!(
            "resource limits missing: {}",
            missing.join(", ")
        )))
    }
}

/// Check bounds and parse. Violations are resource-allocation errors.
pub fn validate_resource_limits(limits: &ResourceLimits) -> Result<ParsedLimits> {
    let cpu: f64 = limits.cpu.trim().parse().map_err(|_| {
        AssessmentError::ResourceAllocation(format!("cpu limit '{}' is not a number", limits.cpu))
    })?;
    if !(MIN_CPU..=MAX_CPU).contains(&cpu) {
        return Err(AssessmentError::ResourceAllocation(format!(
            "cpu limit {} outside [{}, {}] cores",
            cpu, MIN_CPU, MAX_CPU
        )));
    }

    let memory_bytes = parse_size(&limits.memory)
        .map_err(|e| AssessmentError::ResourceAllocation(format!("memory limit: {}", e)))?;
    if !(MIN_MEMORY_BYTES..=MAX_MEMORY_BYTES).contains(&memory_bytes) {
        return Err(AssessmentError::ResourceAllocation(format!(
            "memory limit {} outside [64m, 8g]",
            limits.memory
        )));
    }

    if !is_size_with_unit(&limits.disk_space) {
        return Err(AssessmentError::ResourceAllocation(format!(
            "disk space '{}' must look like <int><k|m|g>",
            limits.disk_space
        )));
    }
    let disk_bytes = parse_size(&limits.disk_space)
        .map_err(|e| AssessmentError::ResourceAllocation(format!("disk space: {}", e)))?;

    Ok(ParsedLimits {
        cpu,
        memory_bytes,
        disk_bytes,
    })
}

fn is_size_with_unit(value: &str) -> bool {
    let value = value.trim();
    match value.char_indices().last() {
        Some((idx, unit)) if matches!(unit.to_ascii_lowercase(), 'k' | 'm' | 'g') => {
            let digits = &value[..idx];
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Half of every dimension, clamped to the minimums.
pub fn degraded_limits(limits: &ParsedLimits) -> ParsedLimits {
    ParsedLimits {
        cpu: (limits.cpu / 2.0).max(MIN_CPU),
        memory_bytes: (limits.memory_bytes / 2).max(MIN_MEMORY_BYTES),
        disk_bytes: (limits.disk_bytes / 2).max(MIN_DISK_BYTES),
    }
}

/// Hostname, optional `*.` wildcard prefix, IP address or CIDR block.
pub fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpNetwork>().is_ok() {
        return true;
    }
    let name = host.strip_prefix("*.").unwrap_or(host);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

pub fn validate_allowed_hosts<'a>(hosts: impl IntoIterator<Item = &'a String>) -> Result<()> {
    let hosts: Vec<&String> = hosts.into_iter().collect();
    if hosts.len() > MAX_ALLOWED_HOSTS {
        return Err(AssessmentError::Validation(format!(
            "{} allowed hosts exceeds the limit of {}",
            hosts.len(),
            MAX_ALLOWED_HOSTS
        )));
    }
    if let Some(bad) = hosts.iter().find(|h| !is_valid_host(h)) {
        return Err(AssessmentError::Validation(format!(
            "allowed host '{}' is not a valid hostname",
            bad
        )));
    }
    Ok(())
}

fn is_sensitive_network(name: &str) -> bool {
    name == "host" || name.starts_with("container:")
}

pub struct SecurityPolicyEngine {
    runtime: SharedRuntime,
    alerts: Arc<AlertBus>,
    retry: RetryPolicies,
    networks: DashMap<String, String>,
    applied: DashMap<String, ParsedLimits>,
}

impl SecurityPolicyEngine {
    pub fn new(runtime: SharedRuntime, alerts: Arc<AlertBus>, retry: RetryPolicies) -> Self {
        Self {
            runtime,
            alerts,
            retry,
            networks: DashMap::new(),
            applied: DashMap::new(),
        }
    }

    pub fn policy_network_name(id: &str) -> String {
        format!("isolab-{}-net", id)
    }

    /// Policy network created for `id`, if any
    pub fn policy_network(&self, id: &str) -> Option<String> {
        self.networks.get(id).map(|n| n.clone())
    }

    /// Limits actually applied to `id`, which may be degraded
    pub fn applied_limits(&self, id: &str) -> Option<ParsedLimits> {
        self.applied.get(id).map(|l| *l)
    }

    fn network_failure(&self, id: &str, error: AssessmentError) -> AssessmentError {
        let error = match error {
            violation @ AssessmentError::SecurityViolation { .. } => violation,
            other => AssessmentError::violation(
                ViolationKind::Network,
                format!("network isolation could not be enforced for {}: {}", id, other),
            ),
        };
        self.alerts.violation(id, ViolationKind::Network, error.to_string());
        error
    }

    /// Apply the network half of `config` to a running sandbox.
    pub async fn apply_network_isolation(&self, id: &str, config: &SecurityConfiguration) -> Result<()> {
        validate_allowed_hosts(&config.allowed_network_access)?;
        let options = RetryOptions::new(self.retry.network_operation.clone());
        let runtime = &self.runtime;

        let details = with_retry(|| runtime.inspect_container(id), &options, "inspect-network")
            .await
            .into_result()
            .map_err(|e| self.network_failure(id, e))?;

        if !config.network_isolation {
            if !details.networks.iter().any(|n| n == "bridge") {
                with_retry(|| runtime.connect_network("bridge", id), &options, "connect-default")
                    .await
                    .into_result()
                    .map_err(|e| self.network_failure(id, e))?;
            }
            info!(env_id = %id, "Network isolation disabled; default network attached");
            return Ok(());
        }

        // Refuse before touching anything if the sandbox shares a namespace
        if let Some(sensitive) = std::iter::once(&details.network_mode)
            .chain(details.networks.iter())
            .find(|n| is_sensitive_network(n))
        {
            return Err(self.network_failure(
                id,
                AssessmentError::violation(
                    ViolationKind::Network,
                    format!("sandbox {} is attached to sensitive network '{}'", id, sensitive),
                ),
            ));
        }

        let policy_network = Self::policy_network_name(id);
        for network in details
            .networks
            .iter()
            .filter(|n| n.as_str() != "none" && **n != policy_network)
        {
            debug!(env_id = %id, network = %network, "Disconnecting");
            with_retry(
                || runtime.disconnect_network(network, id, true),
                &options,
                "disconnect-network",
            )
            .await
            .into_result()
            .map_err(|e| self.network_failure(id, e))?;
        }

        if !config.allowed_network_access.is_empty() {
            if !self.networks.contains_key(id) {
                let mut spec = NetworkSpec::internal_bridge(policy_network.clone());
                spec.labels.insert("isolab.environment".to_string(), id.to_string());
                with_retry(|| runtime.create_network(&spec), &options, "create-network")
                    .await
                    .into_result()
                    .map_err(|e| self.network_failure(id, e))?;
                self.networks.insert(id.to_string(), policy_network.clone());
            }
            if !details.networks.contains(&policy_network) {
                with_retry(
                    || runtime.connect_network(&policy_network, id),
                    &options,
                    "connect-network",
                )
                .await
                .into_result()
                .map_err(|e| self.network_failure(id, e))?;
            }
        }

        info!(
            env_id = %id,
            allowed_hosts = config.allowed_network_access.len(),
            "Network isolation applied"
        );
        Ok(())
    }

    /// Validate and apply cpu/memory caps, degrading once on failure.
    pub async fn set_resource_limits(&self, id: &str, limits: &ResourceLimits) -> Result<AppliedLimits> {
        let requested = validate_resource_limits(limits)?;
        let options = RetryOptions::new(self.retry.resource_allocation.clone());

        let fits = match self.runtime.host_capacity().await {
            Ok(capacity) => {
                let fits = requested.cpu <= capacity.cpus * HOST_CAPACITY_FRACTION
                    && requested.memory_bytes as f64
                        <= capacity.memory_bytes as f64 * HOST_CAPACITY_FRACTION;
                if !fits {
                    warn!(
                        env_id = %id,
                        cpu = requested.cpu,
                        memory_bytes = requested.memory_bytes,
                        host_cpus = capacity.cpus,
                        host_memory_bytes = capacity.memory_bytes,
                        "Requested limits exceed 80% of host capacity"
                    );
                }
                fits
            }
            Err(e) => {
                warn!(env_id = %id, "Host capacity unknown, skipping check: {}", e);
                true
            }
        };

        if fits {
            match self.apply_limits(id, &requested, &options, "update-resources").await {
                Ok(()) => {
                    self.applied.insert(id.to_string(), requested);
                    return Ok(AppliedLimits {
                        limits: requested,
                        degraded: false,
                    });
                }
                Err(e) => warn!(env_id = %id, "Resource update failed, degrading: {}", e),
            }
        }

        let reduced = degraded_limits(&requested);
        let shortened = RetryOptions::new(self.retry.resource_allocation.shortened());
        self.apply_limits(id, &reduced, &shortened, "update-resources-degraded")
            .await
            .map_err(|e| {
                AssessmentError::ResourceAllocation(format!(
                    "degraded limits could not be applied to {}: {}",
                    id, e
                ))
            })?;
        warn!(
            env_id = %id,
            cpu = reduced.cpu,
            memory_bytes = reduced.memory_bytes,
            "Running with degraded resource limits"
        );
        self.applied.insert(id.to_string(), reduced);
        Ok(AppliedLimits {
            limits: reduced,
            degraded: true,
        })
    }

    async fn apply_limits(
        &self,
        id: &str,
        limits: &ParsedLimits,
        options: &RetryOptions,
        name: &str,
    ) -> Result<()> {
        let update = ResourceUpdate {
            memory_bytes: limits.memory_bytes,
            nano_cpus: (limits.cpu * 1_000_000_000.0) as u64,
        };
        let runtime = &self.runtime;
        with_retry(|| runtime.update_resources(id, &update), options, name)
            .await
            .into_result()
    }

    /// Set permission bits on declared mounts, then strip write access from
    /// system paths. Missing paths are logged only.
    pub async fn configure_filesystem_access(&self, id: &str, access: &FilesystemAccess) -> Result<()> {
        for path in &access.read_only_mounts {
            if !self.chmod(id, path, "a-w", true).await? {
                return Err(AssessmentError::violation(
                    ViolationKind::Filesystem,
                    format!("could not make {} read-only in {}", path, id),
                ));
            }
        }
        for path in &access.writable_mounts {
            if !self.chmod(id, path, "u+w", true).await? {
                warn!(env_id = %id, path = %path, "Could not make mount writable");
            }
        }
        for path in SYSTEM_PATHS {
            if !self.chmod(id, path, "a-w", false).await? {
                warn!(env_id = %id, path = %path, "Could not remove write access");
            }
        }
        info!(
            env_id = %id,
            read_only = access.read_only_mounts.len(),
            writable = access.writable_mounts.len(),
            "Filesystem access configured"
        );
        Ok(())
    }

    /// Returns false when chmod failed on an existing path.
    async fn chmod(&self, id: &str, path: &str, mode: &str, recursive: bool) -> Result<bool> {
        let quoted = shell_quote(path);
        let script = format!(
            "if [ -e {p} ]; then chmod {r}{m} {p}; else exit {missing}; fi",
            p = quoted,
            r = if recursive { "-R " } else { "" },
            m = mode,
            missing = MISSING_PATH_EXIT
        );
        let output = self.runtime.exec(id, &shell(script), FS_TIMEOUT).await?;
        match output.exit_code {
            0 => Ok(true),
            MISSING_PATH_EXIT => {
                warn!(env_id = %id, path = %path, "Path not present in sandbox yet");
                Ok(true)
            }
            code => {
                debug!(env_id = %id, path = %path, code, stderr = %output.stderr_lossy(), "chmod failed");
                Ok(false)
            }
        }
    }

    /// Inspect the live sandbox and check that `config` actually holds.
    pub async fn validate_boundaries(&self, id: &str, config: &SecurityConfiguration) -> Result<BoundaryReport> {
        let details = self.runtime.inspect_container(id).await?;
        let mut failures = Vec::new();

        if !details.cap_drop.iter().any(|c| c.eq_ignore_ascii_case("ALL")) {
            failures.push("capabilities are not all dropped".to_string());
        }
        if details.privileged {
            failures.push("container is privileged".to_string());
        }
        if !details
            .security_opt
            .iter()
            .any(|o| o.starts_with("no-new-privileges"))
        {
            failures.push("no-new-privileges is not set".to_string());
        }

        let expected = match self.applied_limits(id) {
            Some(limits) => limits,
            None => validate_resource_limits(&config.resource_limits)?,
        };
        if details.memory_bytes != Some(expected.memory_bytes) {
            failures.push(format!(
                "memory cap {:?} does not match {}",
                details.memory_bytes, expected.memory_bytes
            ));
        }
        let expected_nano = (expected.cpu * 1_000_000_000.0) as u64;
        if details.nano_cpus != Some(expected_nano) {
            failures.push(format!(
                "cpu cap {:?} does not match {}",
                details.nano_cpus, expected_nano
            ));
        }

        if config.network_isolation {
            if is_sensitive_network(&details.network_mode) {
                failures.push(format!("network mode is '{}'", details.network_mode));
            }
            let policy_network = Self::policy_network_name(id);
            for network in &details.networks {
                if network != "none" && *network != policy_network {
                    failures.push(format!("attached to non-isolated network '{}'", network));
                }
            }
        }

        let report = BoundaryReport {
            passed: failures.is_empty(),
            failures,
        };
        if report.passed {
            debug!(env_id = %id, "Security boundaries hold");
        } else {
            warn!(env_id = %id, failures = ?report.failures, "Security boundaries violated");
        }
        Ok(report)
    }

    /// Remove policy state for `id`. Network removal is best effort.
    pub async fn cleanup(&self, id: &str) {
        self.applied.remove(id);
        if let Some((_, network)) = self.networks.remove(id) {
            if let Err(e) = self.runtime.disconnect_network(&network, id, true).await {
                debug!(env_id = %id, network = %network, "Disconnect during cleanup: {}", e);
            }
            if let Err(e) = self.runtime.remove_network(&network).await {
                warn!(env_id = %id, network = %network, "Failed to remove policy network: {}", e);
            }
        }
    }
}
