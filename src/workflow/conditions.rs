// Step condition evaluation

use super::definition::{ConditionKind, StepCondition};
use super::tools::ToolContext;
use crate::sandbox::error::Result;
use crate::sandbox::runtime::{shell, shell_quote};
use std::time::Duration;

const CONDITION_TIMEOUT: Duration = Duration::from_secs(30);

/// Manifests searched when a framework is not declared up front
const MANIFESTS: [&str; 10] = [
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "Pipfile",
    "Cargo.toml",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "Gemfile",
    "composer.json",
];

fn extensions_for(language: &str) -> Vec<String> {
    let known: &[&str] = match language {
        "javascript" | "js" => &["js", "jsx", "mjs", "cjs"],
        "typescript" | "ts" => &["ts", "tsx"],
        "python" | "py" => &["py"],
        "rust" | "rs" => &["rs"],
        "go" | "golang" => &["go"],
        "java" => &["java"],
        "kotlin" => &["kt", "kts"],
        "ruby" => &["rb"],
        "php" => &["php"],
        "c" => &["c", "h"],
        "cpp" | "c++" => &["cpp", "cc", "cxx", "hpp"],
        "csharp" | "c#" => &["cs"],
        "shell" | "bash" => &["sh", "bash"],
        _ => &[],
    };
    if known.is_empty() {
        vec![language.to_string()]
    } else {
        known.iter().map(|e| e.to_string()).collect()
    }
}

fn resolve_in_mount(mount_point: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            mount_point.trim_end_matches('/'),
            path.trim_start_matches("./")
        )
    }
}

/// Whether `condition` holds for the environment in `ctx`.
pub async fn evaluate(ctx: &ToolContext, condition: &StepCondition) -> Result<bool> {
    let value = condition.value.trim();
    let mount = shell_quote(&ctx.mount_point);

    let script = match condition.kind {
        ConditionKind::FileExists => {
            format!("test -e {}", shell_quote(&resolve_in_mount(&ctx.mount_point, value)))
        }
        ConditionKind::LanguageDetected => {
            let language = value.to_ascii_lowercase();
            let declared = ctx
                .analysis_config
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&language))
                || ctx.analysis_config.codebase_type.as_str() == language;
            if declared {
                return Ok(true);
            }
            let names: Vec<String> = extensions_for(&language)
                .iter()
                .map(|ext| format!("-name {}", shell_quote(&format!("*.{}", ext))))
                .collect();
            format!(
                "find {} -type f \\( {} \\) -not -path '*/node_modules/*' -not -path '*/.git/*' | head -n 1 | grep -q .",
                mount,
                names.join(" -o ")
            )
        }
        ConditionKind::FrameworkDetected => {
            let declared = ctx
                .analysis_config
                .frameworks
                .iter()
                .any(|f| f.eq_ignore_ascii_case(value));
            if declared {
                return Ok(true);
            }
            format!(
                "cd {} && grep -qiw -e {} {} 2>/dev/null",
                mount,
                shell_quote(value),
                MANIFESTS.join(" ")
            )
        }
        ConditionKind::Custom => format!("cd {} && {}", mount, value),
    };

    let output = ctx
        .runtime
        .exec(&ctx.container_id, &shell(script), CONDITION_TIMEOUT)
        .await?;
    Ok(output.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::memory::InMemoryRuntime;
    use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
    use crate::sandbox::types::AnalysisConfiguration;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn context(runtime: Arc<InMemoryRuntime>, analysis: AnalysisConfiguration) -> ToolContext {
        runtime
            .create_container(&ContainerSpec {
                name: "env".into(),
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
            environment_id: "env".into(),
            container_id: "env".into(),
            mount_point: "/workspace".into(),
            analysis_config: analysis,
            runtime,
            timeout: Duration::from_secs(5),
        }
    }

    fn condition(kind: ConditionKind, value: &str) -> StepCondition {
        StepCondition {
            kind,
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn test_declared_language_short_circuits() {
        let runtime = Arc::new(InMemoryRuntime::new());
        let analysis = AnalysisConfiguration {
            languages: vec!["Python".into()],
            ..Default::default()
        };
        let ctx = context(runtime.clone(), analysis).await;

        assert!(evaluate(&ctx, &condition(ConditionKind::LanguageDetected, "python"))
            .await
            .unwrap());
        assert_eq!(runtime.call_count("exec"), 0);
    }

    #[tokio::test]
    async fn test_file_exists_resolves_relative_to_mount() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_exec_handler(|_, cmd| ExecOutput {
            exit_code: if cmd[2] == "test -e '/workspace/package.json'" { 0 } else { 1 },
            ..Default::default()
        });
        let ctx = context(runtime, AnalysisConfiguration::default()).await;

        assert!(evaluate(&ctx, &condition(ConditionKind::FileExists, "package.json"))
            .await
            .unwrap());
        assert!(!evaluate(&ctx, &condition(ConditionKind::FileExists, "setup.py"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_framework_probe_greps_manifests() {
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.set_exec_handler(|_, cmd| ExecOutput {
            exit_code: if cmd[2].contains("'react'") && cmd[2].contains("package.json") { 0 } else { 1 },
            ..Default::default()
        });
        let ctx = context(runtime, AnalysisConfiguration::default()).await;

        assert!(evaluate(&ctx, &condition(ConditionKind::FrameworkDetected, "react"))
            .await
            .unwrap());
        assert!(!evaluate(&ctx, &condition(ConditionKind::FrameworkDetected, "django"))
            .await
            .unwrap());
    }

    #[test]
    fn test_extension_lookup() {
        assert_eq!(extensions_for("typescript"), vec!["ts", "tsx"]);
        assert_eq!(extensions_for("zig"), vec!["zig"]);
    }
}
