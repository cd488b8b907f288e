// Core data structures for assessment environments

use super::error::{AssessmentError, Result};
use crate::workflow::AnalysisResults;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Security policy requested for an environment. Immutable once the
/// environment exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfiguration {
    pub network_isolation: bool,
    #[serde(default)]
    pub allowed_network_access: BTreeSet<String>,
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub filesystem_access: FilesystemAccess,
    #[serde(default)]
    pub security_policies: BTreeSet<String>,
}

impl Default for SecurityConfiguration {
    fn default() -> Self {
        Self {
            network_isolation: true,
            allowed_network_access: BTreeSet::new(),
            resource_limits: ResourceLimits::default(),
            filesystem_access: FilesystemAccess::default(),
            security_policies: BTreeSet::new(),
        }
    }
}

/// Resource caps as written by the caller: cpu in cores ("1.0"), memory and
/// disk as sizes ("512m", "1g").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
    pub disk_space: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "1.0".to_string(),
            memory: "512m".to_string(),
            disk_space: "1g".to_string(),
        }
    }
}

impl ResourceLimits {
    pub fn from_parsed(limits: &ParsedLimits) -> Self {
        Self {
            cpu: format!("{:.2}", limits.cpu),
            memory: format!("{}k", limits.memory_bytes / 1024),
            disk_space: format!("{}k", limits.disk_bytes / 1024),
        }
    }
}

/// Numeric form of [`ResourceLimits`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedLimits {
    pub cpu: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemAccess {
    #[serde(default)]
    pub read_only_mounts: BTreeSet<String>,
    #[serde(default)]
    pub writable_mounts: BTreeSet<String>,
}

/// Kind of codebase under assessment; selects the base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodebaseType {
    Node,
    Python,
    Rust,
    Go,
    Java,
    #[default]
    Generic,
}

impl CodebaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodebaseType::Node => "node",
            CodebaseType::Python => "python",
            CodebaseType::Rust => "rust",
            CodebaseType::Go => "go",
            CodebaseType::Java => "java",
            CodebaseType::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "javascript" | "typescript" => Some(CodebaseType::Node),
            "python" => Some(CodebaseType::Python),
            "rust" => Some(CodebaseType::Rust),
            "go" | "golang" => Some(CodebaseType::Go),
            "java" => Some(CodebaseType::Java),
            "generic" => Some(CodebaseType::Generic),
            _ => None,
        }
    }
}

impl fmt::Display for CodebaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to analyse and how
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfiguration {
    #[serde(default)]
    pub codebase_type: CodebaseType,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(default)]
    pub workflow: Option<String>,
}

/// Environment status. Moves forward only; `Failed` is reachable from any
/// state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentStatus {
    Creating,
    Ready,
    Analyzing,
    Completed,
    Failed,
}

impl EnvironmentStatus {
    fn rank(self) -> u8 {
        match self {
            EnvironmentStatus::Creating => 0,
            EnvironmentStatus::Ready => 1,
            EnvironmentStatus::Analyzing => 2,
            EnvironmentStatus::Completed => 3,
            EnvironmentStatus::Failed => 4,
        }
    }

    pub fn can_transition_to(self, next: EnvironmentStatus) -> bool {
        match (self, next) {
            (EnvironmentStatus::Failed, _) => false,
            (_, EnvironmentStatus::Failed) => true,
            (EnvironmentStatus::Completed, _) => false,
            (current, next) => next.rank() == current.rank() + 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Creating => "creating",
            EnvironmentStatus::Ready => "ready",
            EnvironmentStatus::Analyzing => "analyzing",
            EnvironmentStatus::Completed => "completed",
            EnvironmentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sandbox provisioned for one assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentEnvironment {
    pub id: String,
    pub status: EnvironmentStatus,
    pub security_config: SecurityConfiguration,
    pub analysis_config: AnalysisConfiguration,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub results: Option<AnalysisResults>,
    pub error: Option<String>,
}

impl AssessmentEnvironment {
    pub(crate) fn new(
        id: String,
        security_config: SecurityConfiguration,
        analysis_config: AnalysisConfiguration,
    ) -> Self {
        Self {
            id,
            status: EnvironmentStatus::Creating,
            security_config,
            analysis_config,
            created_at: Utc::now(),
            completed_at: None,
            results: None,
            error: None,
        }
    }

    /// Move to `next`, rejecting backwards or skipping transitions.
    pub(crate) fn transition(&mut self, next: EnvironmentStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AssessmentError::Validation(format!(
                "environment {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if matches!(next, EnvironmentStatus::Completed | EnvironmentStatus::Failed) {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Parse size string (e.g., "2G", "512m", "1024k", "4096")
pub fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim();
    let (num_str, unit) = match size_str.chars().last() {
        Some('g') | Some('G') => (&size_str[..size_str.len() - 1], 1024 * 1024 * 1024),
        Some('m') | Some('M') => (&size_str[..size_str.len() - 1], 1024 * 1024),
        Some('k') | Some('K') => (&size_str[..size_str.len() - 1], 1024),
        _ => (size_str, 1),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| AssessmentError::Validation(format!("Invalid size: {}", size_str)))?;

    num.checked_mul(unit)
        .ok_or_else(|| AssessmentError::Validation(format!("Size overflows: {}", size_str)))
}
