//! CLI commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config;
use crate::logging;
use crate::sandbox::{
    AnalysisConfiguration, CodebaseType, DockerRuntime, InMemoryRuntime, ResourceLimits,
    SecurityConfiguration, SharedRuntime,
};
use crate::service::AssessmentService;
use crate::workflow::{WorkflowCatalog, WorkflowResult};

#[derive(Parser)]
#[command(name = "isolab", version, about = "isolab: disposable sandboxes for assessing untrusted code")]
struct Cli {
    /// Config file (default: ~/.isolab/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox, mount a codebase, run a workflow and tear everything down.
    Run {
        /// Directory holding the code to assess.
        #[arg(short, long)]
        source: PathBuf,

        /// Workflow name (looked up in the workflows directory) or path to a workflow file.
        #[arg(short, long)]
        workflow: String,

        /// node | python | rust | go | java | generic
        #[arg(long)]
        codebase_type: Option<String>,

        /// Memory cap, e.g. "512m".
        #[arg(long)]
        memory: Option<String>,

        /// CPU cap in cores, e.g. "1.0".
        #[arg(long)]
        cpu: Option<String>,

        /// Disk cap, e.g. "1g".
        #[arg(long)]
        disk: Option<String>,

        /// Host the sandbox may reach. Repeatable.
        #[arg(long = "allow-host")]
        allow_hosts: Vec<String>,

        /// Attach the sandbox to the default bridge instead of no network.
        #[arg(long)]
        no_isolation: bool,

        /// Use the in-process runtime instead of Docker.
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a workflow file without running it.
    ValidateWorkflow {
        path: PathBuf,
    },

    /// List workflows in the configured workflows directory.
    ListWorkflows,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            workflow,
            codebase_type,
            memory,
            cpu,
            disk,
            allow_hosts,
            no_isolation,
            dry_run,
        } => {
            let limits = build_limits(cpu, memory, disk);
            let security = SecurityConfiguration {
                network_isolation: !no_isolation,
                allowed_network_access: allow_hosts.into_iter().collect::<BTreeSet<_>>(),
                resource_limits: limits,
                ..Default::default()
            };
            let analysis = AnalysisConfiguration {
                codebase_type: parse_codebase_type(codebase_type.as_deref())?,
                workflow: Some(workflow.clone()),
                ..Default::default()
            };
            cmd_run(cli.config.as_deref(), &source, &workflow, security, analysis, dry_run).await
        }
        Commands::ValidateWorkflow { path } => cmd_validate_workflow(&path),
        Commands::ListWorkflows => cmd_list_workflows(cli.config.as_deref()),
    }
}

fn build_limits(cpu: Option<String>, memory: Option<String>, disk: Option<String>) -> ResourceLimits {
    let defaults = ResourceLimits::default();
    ResourceLimits {
        cpu: cpu.unwrap_or(defaults.cpu),
        memory: memory.unwrap_or(defaults.memory),
        disk_space: disk.unwrap_or(defaults.disk_space),
    }
}

fn parse_codebase_type(raw: Option<&str>) -> Result<CodebaseType> {
    match raw {
        None => Ok(CodebaseType::Generic),
        Some(value) => CodebaseType::parse(value)
            .ok_or_else(|| anyhow::anyhow!("Unknown codebase type '{}'", value)),
    }
}

fn build_runtime(cfg: &config::Config, dry_run: bool) -> Result<SharedRuntime> {
    if dry_run {
        info!("Dry run: using the in-process runtime");
        return Ok(Arc::new(InMemoryRuntime::new()));
    }
    let docker = DockerRuntime::connect()
        .context("Connect to Docker (use --dry-run to try without it)")?
        .with_storage_quota(cfg.environment.storage_quota);
    Ok(Arc::new(docker))
}

async fn cmd_run(
    config_path: Option<&Path>,
    source: &Path,
    workflow: &str,
    security: SecurityConfiguration,
    analysis: AnalysisConfiguration,
    dry_run: bool,
) -> Result<()> {
    let cfg = config::load_config(config_path)?;
    let _log_guard = logging::init_logging(&cfg.log, &config::log_dir_path(&cfg))?;

    let runtime = build_runtime(&cfg, dry_run)?;
    let service = AssessmentService::new(runtime, cfg.manager_options(), config::workflows_dir_path(&cfg))
        .context("Build assessment service")?;

    let mut alerts = service.subscribe_alerts();
    tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(alert) => eprintln!(
                    "[isolab alert] {} {:?} ({:?}): {}",
                    alert.environment, alert.kind, alert.severity, alert.message
                ),
                Err(RecvError::Lagged(missed)) => eprintln!("[isolab alert] {} alerts dropped", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let env = service
        .create_environment(security, analysis)
        .await
        .context("Create assessment environment")?;
    info!(env_id = %env.id, "Environment ready");

    let outcome = assess(&service, &env.id, source, workflow).await;

    if let Err(e) = service.destroy_environment(&env.id).await {
        warn!(env_id = %env.id, "Teardown failed: {}", e);
    }

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        anyhow::bail!(
            "Workflow '{}' finished with {} error(s){}",
            result.workflow,
            result.errors.len(),
            if result.degraded { " in degraded mode" } else { "" }
        );
    }
    Ok(())
}

async fn assess(service: &AssessmentService, id: &str, source: &Path, workflow: &str) -> Result<WorkflowResult> {
    let report = service
        .mount_codebase(id, source, None)
        .await
        .with_context(|| format!("Mount {}", source.display()))?;
    info!(env_id = %id, files = report.files, bytes = report.bytes, "Codebase mounted");

    let result = service
        .execute_workflow(id, workflow)
        .await
        .with_context(|| format!("Run workflow '{}'", workflow))?;
    Ok(result)
}

fn cmd_validate_workflow(path: &Path) -> Result<()> {
    logging::init_simple_logging();
    let definition = WorkflowCatalog::load_file(path)?;
    println!(
        "✓ {} v{}: {} step(s), {} parallel group(s), {} cleanup step(s)",
        definition.name,
        definition.version,
        definition.steps.len(),
        definition.parallel_steps.len(),
        definition.cleanup.len()
    );
    Ok(())
}

fn cmd_list_workflows(config_path: Option<&Path>) -> Result<()> {
    logging::init_simple_logging();
    let cfg = config::load_config(config_path)?;
    let catalog = WorkflowCatalog::new(config::workflows_dir_path(&cfg));
    let workflows = catalog.list()?;
    if workflows.is_empty() {
        println!("No workflows in {}", catalog.dir().display());
        return Ok(());
    }
    for summary in workflows {
        let types: Vec<&str> = summary.codebase_types.iter().map(|t| t.as_str()).collect();
        println!("{:<24} {:<10} [{}]  {}", summary.name, summary.version, types.join(","), summary.description);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_fill_in_defaults() {
        let limits = build_limits(None, Some("2g".into()), None);
        assert_eq!(limits.memory, "2g");
        assert_eq!(limits.cpu, "1.0");
        assert_eq!(limits.disk_space, "1g");
    }

    #[test]
    fn test_codebase_type_parsing() {
        assert_eq!(parse_codebase_type(None).unwrap(), CodebaseType::Generic);
        assert_eq!(parse_codebase_type(Some("TypeScript")).unwrap(), CodebaseType::Node);
        assert!(parse_codebase_type(Some("cobol")).is_err());
    }

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "isolab",
            "run",
            "--source",
            "/tmp/app",
            "--workflow",
            "audit",
            "--allow-host",
            "registry.npmjs.org",
            "--allow-host",
            "pypi.org",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { allow_hosts, dry_run, no_isolation, .. } => {
                assert_eq!(allow_hosts.len(), 2);
                assert!(dry_run);
                assert!(!no_isolation);
            }
            _ => panic!("expected run"),
        }
    }
}
