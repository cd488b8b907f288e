// Error taxonomy for assessment environments, policy enforcement and workflows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Kind of isolation breach behind a [`AssessmentError::SecurityViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    Network,
    Filesystem,
    PrivilegeEscalation,
    MaliciousCode,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ViolationKind::Network => "network",
            ViolationKind::Filesystem => "filesystem",
            ViolationKind::PrivilegeEscalation => "privilege-escalation",
            ViolationKind::MaliciousCode => "malicious-code",
        };
        f.write_str(s)
    }
}

/// What survived a workflow that could not run to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialFailure {
    pub environment_id: String,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub last_checkpoint: Option<crate::resilience::RecoveryCheckpoint>,
    pub partial_results: crate::workflow::AnalysisResults,
    pub cause: String,
}

/// Main error type
#[derive(Debug, Error)]
pub enum AssessmentError {
    #[error("Container creation failed: {0}")]
    ContainerCreation(String),

    #[error("Container start failed: {0}")]
    ContainerStart(String),

    #[error("Container stop failed: {0}")]
    ContainerStop(String),

    #[error("Container destroy failed: {0}")]
    ContainerDestroy(String),

    #[error("Resource allocation failed: {0}")]
    ResourceAllocation(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Security violation ({kind}): {message}")]
    SecurityViolation { kind: ViolationKind, message: String },

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Workflow step '{step}' failed: {message}")]
    WorkflowStepFailed { step: String, message: String },

    #[error("Analysis only partially completed ({} steps done): {}", .0.completed_steps.len(), .0.cause)]
    PartialAnalysis(Box<PartialFailure>),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("External resource rejected: {0}")]
    ExternalResource(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AssessmentError {
    pub fn violation(kind: ViolationKind, message: impl Into<String>) -> Self {
        AssessmentError::SecurityViolation {
            kind,
            message: message.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AssessmentError::ContainerCreation(_) => "CONTAINER_CREATION_FAILED",
            AssessmentError::ContainerStart(_) => "CONTAINER_START_FAILED",
            AssessmentError::ContainerStop(_) => "CONTAINER_STOP_FAILED",
            AssessmentError::ContainerDestroy(_) => "CONTAINER_DESTROY_FAILED",
            AssessmentError::ResourceAllocation(_) => "RESOURCE_ALLOCATION_FAILED",
            AssessmentError::ResourceLimitExceeded(_) => "RESOURCE_LIMIT_EXCEEDED",
            AssessmentError::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            AssessmentError::SecurityViolation { kind, .. } => match kind {
                ViolationKind::Network => "NETWORK_SECURITY_VIOLATION",
                ViolationKind::Filesystem => "FILESYSTEM_SECURITY_VIOLATION",
                ViolationKind::PrivilegeEscalation => "PRIVILEGE_ESCALATION",
                ViolationKind::MaliciousCode => "MALICIOUS_CODE_DETECTED",
            },
            AssessmentError::AnalysisFailed(_) => "ANALYSIS_FAILED",
            AssessmentError::WorkflowStepFailed { .. } => "WORKFLOW_STEP_FAILED",
            AssessmentError::PartialAnalysis(_) => "PARTIAL_ANALYSIS_FAILURE",
            AssessmentError::Configuration(_) => "CONFIGURATION_ERROR",
            AssessmentError::Validation(_) => "VALIDATION_ERROR",
            AssessmentError::Network(_) => "NETWORK_ERROR",
            AssessmentError::ExternalResource(_) => "EXTERNAL_RESOURCE_REJECTED",
            AssessmentError::Timeout(_) => "OPERATION_TIMEOUT",
            AssessmentError::CircuitOpen(_) => "CIRCUIT_OPEN",
            AssessmentError::NotFound(_) => "ENVIRONMENT_NOT_FOUND",
            AssessmentError::Io(_) => "IO_ERROR",
            AssessmentError::Json(_) => "JSON_ERROR",
        }
    }

    fn suggestion(&self) -> &'static str {
        match self {
            AssessmentError::ContainerCreation(_) | AssessmentError::ContainerStart(_) => {
                "Ensure the container daemon is reachable and the base image is available"
            }
            AssessmentError::ContainerStop(_) | AssessmentError::ContainerDestroy(_) => {
                "Inspect the container manually; it may need to be removed by hand"
            }
            AssessmentError::ResourceAllocation(_)
            | AssessmentError::ResourceLimitExceeded(_)
            | AssessmentError::InsufficientResources(_) => {
                "Lower the requested cpu/memory/disk limits or free host capacity"
            }
            AssessmentError::SecurityViolation { .. } => {
                "The environment was terminated; review the flagged content before retrying"
            }
            AssessmentError::AnalysisFailed(_)
            | AssessmentError::WorkflowStepFailed { .. }
            | AssessmentError::PartialAnalysis(_) => {
                "Check the failing step's tool configuration; partial results are attached"
            }
            AssessmentError::Configuration(_) | AssessmentError::Validation(_) => {
                "Fix the configuration or workflow definition and try again"
            }
            AssessmentError::Network(_) => "Check the container network configuration",
            AssessmentError::ExternalResource(_) => {
                "Add the registry to the allow-list or verify the artifact checksum"
            }
            AssessmentError::Timeout(_) => "Increase the timeout or reduce the workload",
            AssessmentError::CircuitOpen(_) => {
                "The daemon is failing repeatedly; wait for the cool-down before retrying"
            }
            AssessmentError::NotFound(_) => "Verify the environment id",
            AssessmentError::Io(_) => "Check file permissions and disk space",
            AssessmentError::Json(_) => "Ensure the JSON document is well formed",
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AssessmentError::SecurityViolation { .. } => ErrorSeverity::Critical,
            AssessmentError::ResourceLimitExceeded(_) => ErrorSeverity::Critical,
            AssessmentError::ContainerCreation(_)
            | AssessmentError::ContainerStart(_)
            | AssessmentError::ContainerDestroy(_)
            | AssessmentError::ResourceAllocation(_)
            | AssessmentError::InsufficientResources(_)
            | AssessmentError::AnalysisFailed(_)
            | AssessmentError::Configuration(_)
            | AssessmentError::Validation(_)
            | AssessmentError::ExternalResource(_)
            | AssessmentError::Io(_) => ErrorSeverity::Error,
            AssessmentError::ContainerStop(_)
            | AssessmentError::WorkflowStepFailed { .. }
            | AssessmentError::PartialAnalysis(_)
            | AssessmentError::Network(_)
            | AssessmentError::Timeout(_)
            | AssessmentError::CircuitOpen(_)
            | AssessmentError::NotFound(_)
            | AssessmentError::Json(_) => ErrorSeverity::Warning,
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AssessmentError::SecurityViolation { .. }
            | AssessmentError::ResourceLimitExceeded(_)
            | AssessmentError::Configuration(_)
            | AssessmentError::Validation(_)
            | AssessmentError::ExternalResource(_)
            | AssessmentError::NotFound(_)
            | AssessmentError::Json(_) => false,
            _ => true,
        }
    }

    /// Whether a retry of the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AssessmentError::CircuitOpen(_) | AssessmentError::PartialAnalysis(_) => false,
            other => other.is_recoverable(),
        }
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, AssessmentError::SecurityViolation { .. })
    }

    pub fn is_container_error(&self) -> bool {
        matches!(
            self,
            AssessmentError::ContainerCreation(_)
                | AssessmentError::ContainerStart(_)
                | AssessmentError::ContainerStop(_)
                | AssessmentError::ContainerDestroy(_)
        )
    }

    pub fn is_resource_error(&self) -> bool {
        matches!(
            self,
            AssessmentError::ResourceAllocation(_)
                | AssessmentError::ResourceLimitExceeded(_)
                | AssessmentError::InsufficientResources(_)
        )
    }

    pub fn is_analysis_error(&self) -> bool {
        matches!(
            self,
            AssessmentError::AnalysisFailed(_)
                | AssessmentError::WorkflowStepFailed { .. }
                | AssessmentError::PartialAnalysis(_)
        )
    }

    /// Convert error to detailed error report in JSON format
    pub fn to_error_report(
        &self,
        environment_id: Option<&str>,
        context: Option<HashMap<String, String>>,
    ) -> ErrorReport {
        let mut error_context = context.unwrap_or_default();
        if let Some(id) = environment_id {
            error_context.insert("environment_id".to_string(), id.to_string());
        }
        if let AssessmentError::PartialAnalysis(partial) = self {
            error_context.insert("completed_steps".to_string(), partial.completed_steps.join(","));
            error_context.insert("failed_steps".to_string(), partial.failed_steps.join(","));
        }

        ErrorReport {
            error_code: self.code().to_string(),
            error_message: self.to_string(),
            severity: self.severity(),
            recoverable: self.is_recoverable(),
            timestamp: Utc::now(),
            context: error_context,
            suggestion: self.suggestion().to_string(),
        }
    }
}

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Detailed error report structure
///
/// Suitable for logging and for handing to report collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_code: String,
    pub error_message: String,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
    pub context: HashMap<String, String>,
    pub suggestion: String,
}

impl ErrorReport {
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Result type alias for assessment operations
pub type Result<T> = std::result::Result<T, AssessmentError>;
