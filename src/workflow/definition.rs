// Workflow definitions and the on-disk catalog

use crate::sandbox::error::{AssessmentError, Result};
use crate::sandbox::types::CodebaseType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Definition types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionKind {
    FileExists,
    LanguageDetected,
    FrameworkDetected,
    Custom,
}

/// Gate on whether a step runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    /// Path, language, framework name or shell predicate depending on `kind`
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    #[serde(default)]
    pub codebase_types: Vec<CodebaseType>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel_steps: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn grouped_names(&self) -> HashSet<&str> {
        self.parallel_steps
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Steps not named in any parallel group, in declaration order
    pub fn sequential_steps(&self) -> Vec<&WorkflowStep> {
        let grouped = self.grouped_names();
        self.steps
            .iter()
            .filter(|s| !grouped.contains(s.name.as_str()))
            .collect()
    }

    /// Resolve each parallel group to its steps; unknown names are dropped.
    pub fn parallel_groups(&self) -> Vec<Vec<&WorkflowStep>> {
        self.parallel_steps
            .iter()
            .map(|group| group.iter().filter_map(|name| self.step(name)).collect())
            .collect()
    }

    pub fn supports(&self, codebase_type: CodebaseType) -> bool {
        self.codebase_types.contains(&codebase_type)
            || self.codebase_types.contains(&CodebaseType::Generic)
    }

    /// Structural validation. All problems are reported at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("workflow name is required".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("workflow version is required".to_string());
        }
        if self.steps.is_empty() {
            problems.push("workflow must declare at least one step".to_string());
        }
        if self.codebase_types.is_empty() {
            problems.push("workflow must declare at least one codebase type".to_string());
        }

        check_steps("step", &self.steps, &mut problems);
        check_steps("cleanup step", &self.cleanup, &mut problems);

        let declared: HashSet<&str> = self.steps.iter().map(|s| s.name.as_str()).collect();
        let mut owner: HashMap<&str, usize> = HashMap::new();
        for (index, group) in self.parallel_steps.iter().enumerate() {
            if group.is_empty() {
                problems.push(format!("parallel group {} is empty", index));
            }
            for name in group {
                if !declared.contains(name.as_str()) {
                    problems.push(format!(
                        "parallel group {} references undeclared step '{}'",
                        index, name
                    ));
                }
                if let Some(previous) = owner.insert(name.as_str(), index) {
                    problems.push(format!(
                        "step '{}' appears in parallel groups {} and {}",
                        name, previous, index
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AssessmentError::Validation(format!(
                "workflow '{}' is invalid: {}",
                self.name,
                problems.join("; ")
            )))
        }
    }
}

fn check_steps(label: &str, steps: &[WorkflowStep], problems: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            problems.push(format!("{} without a name", label));
            continue;
        }
        if !seen.insert(step.name.as_str()) {
            problems.push(format!("duplicate {} name '{}'", label, step.name));
        }
        if step.tool.trim().is_empty() {
            problems.push(format!("{} '{}' has no tool", label, step.name));
        }
        if let Some(condition) = &step.condition {
            if condition.value.trim().is_empty() {
                problems.push(format!("{} '{}' has an empty condition", label, step.name));
            }
        }
        if step.timeout == Some(0) {
            problems.push(format!("{} '{}' has a zero timeout", label, step.name));
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub name: String,
    pub version: String,
    pub description: String,
    pub codebase_types: Vec<CodebaseType>,
    pub path: PathBuf,
}

/// Workflow files stored as `<name>.json` in one directory
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    dir: PathBuf,
}

impl WorkflowCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load by catalog name or by file path.
    pub fn load(&self, name_or_path: &str) -> Result<WorkflowDefinition> {
        let as_path = Path::new(name_or_path);
        let looks_like_path = as_path.extension().is_some_and(|ext| ext == "json")
            || name_or_path.contains(std::path::MAIN_SEPARATOR)
            || name_or_path.contains('/');
        if looks_like_path || as_path.is_file() {
            return Self::load_file(as_path);
        }

        let path = self.dir.join(format!("{}.json", name_or_path));
        if !path.is_file() {
            return Err(AssessmentError::Configuration(format!(
                "workflow '{}' not found in {}",
                name_or_path,
                self.dir.display()
            )));
        }
        Self::load_file(&path)
    }

    pub fn load_file(path: &Path) -> Result<WorkflowDefinition> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AssessmentError::Configuration(format!("cannot read workflow {}: {}", path.display(), e))
        })?;
        let definition: WorkflowDefinition = serde_json::from_str(&text).map_err(|e| {
            AssessmentError::Validation(format!("malformed workflow {}: {}", path.display(), e))
        })?;
        definition.validate()?;
        tracing::debug!(workflow = %definition.name, path = %path.display(), "Workflow loaded");
        Ok(definition)
    }

    /// Validate and write `definition`, to `path` or into the catalog.
    pub fn save(&self, definition: &WorkflowDefinition, path: Option<&Path>) -> Result<PathBuf> {
        definition.validate()?;
        let target = match path {
            Some(p) => p.to_path_buf(),
            None => self.dir.join(format!("{}.json", definition.name)),
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(definition)?;
        std::fs::write(&target, json)?;
        tracing::info!(workflow = %definition.name, path = %target.display(), "Workflow saved");
        Ok(target)
    }

    /// Every valid workflow in the catalog; invalid files are skipped.
    pub fn list(&self) -> Result<Vec<WorkflowSummary>> {
        let pattern = self.dir.join("*.json");
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern)
            .map_err(|e| AssessmentError::Configuration(format!("bad workflows dir: {}", e)))?;

        let mut summaries = Vec::new();
        for path in entries.flatten() {
            match Self::load_file(&path) {
                Ok(def) => summaries.push(WorkflowSummary {
                    name: def.name,
                    version: def.version,
                    description: def.description,
                    codebase_types: def.codebase_types,
                    path,
                }),
                Err(e) => tracing::warn!(path = %path.display(), "Skipping workflow: {}", e),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}
