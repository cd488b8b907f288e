//! Workflow engine: definitions and catalog, condition evaluation, tool
//! adapters, result aggregation and the orchestrator.

pub mod conditions;
pub mod definition;
pub mod orchestrator;
pub mod results;
pub mod tools;

pub use definition::{
    ConditionKind, StepCondition, WorkflowCatalog, WorkflowDefinition, WorkflowStep, WorkflowSummary,
};
pub use orchestrator::{WorkflowError, WorkflowOrchestrator, WorkflowResult};
pub use results::{
    AnalysisResults, CodeQualityIssue, FindingSeverity, PerformanceMetric, Recommendation,
    SecurityFinding, TestResult, TestStatus,
};
pub use tools::{CommandAdapter, ToolAdapter, ToolContext, ToolRegistry};
