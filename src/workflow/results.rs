//! Aggregated analysis output.
//!
//! Tool adapters return partial [`AnalysisResults`]; the orchestrator merges
//! them category by category.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityFinding {
    pub id: Option<String>,
    pub severity: FindingSeverity,
    pub title: String,
    pub description: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeQualityIssue {
    pub rule: String,
    pub severity: FindingSeverity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub tool: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[default]
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestResult {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: Option<u64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceMetric {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Recommendation {
    pub title: String,
    pub description: String,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisResults {
    pub security_findings: Vec<SecurityFinding>,
    pub code_quality_issues: Vec<CodeQualityIssue>,
    pub test_results: Vec<TestResult>,
    pub performance_metrics: Vec<PerformanceMetric>,
    pub recommendations: Vec<Recommendation>,
}

impl AnalysisResults {
    /// Append every category of `other`. No deduplication.
    pub fn merge(&mut self, other: AnalysisResults) {
        self.security_findings.extend(other.security_findings);
        self.code_quality_issues.extend(other.code_quality_issues);
        self.test_results.extend(other.test_results);
        self.performance_metrics.extend(other.performance_metrics);
        self.recommendations.extend(other.recommendations);
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    pub fn total_items(&self) -> usize {
        self.security_findings.len()
            + self.code_quality_issues.len()
            + self.test_results.len()
            + self.performance_metrics.len()
            + self.recommendations.len()
    }

    /// Security findings at or above `severity`
    pub fn findings_at_least(&self, severity: FindingSeverity) -> usize {
        self.security_findings
            .iter()
            .filter(|f| f.severity >= severity)
            .count()
    }

    pub fn failed_tests(&self) -> usize {
        self.test_results
            .iter()
            .filter(|t| t.status == TestStatus::Failed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_concatenates_without_dedup() {
        let finding = SecurityFinding {
            severity: FindingSeverity::High,
            title: "hardcoded secret".into(),
            ..Default::default()
        };
        let mut total = AnalysisResults {
            security_findings: vec![finding.clone()],
            ..Default::default()
        };
        total.merge(AnalysisResults {
            security_findings: vec![finding],
            test_results: vec![TestResult {
                name: "unit".into(),
                status: TestStatus::Failed,
                ..Default::default()
            }],
            ..Default::default()
        });

        assert_eq!(total.security_findings.len(), 2);
        assert_eq!(total.total_items(), 3);
        assert_eq!(total.findings_at_least(FindingSeverity::High), 2);
        assert_eq!(total.failed_tests(), 1);
    }

    #[test]
    fn test_partial_json_is_accepted() {
        let json = r#"{"codeQualityIssues": [{"rule": "no-eval", "severity": "medium"}]}"#;
        let parsed: AnalysisResults = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.code_quality_issues[0].rule, "no-eval");
        assert!(parsed.security_findings.is_empty());
    }
}
