//! # isolab - Sandboxed assessment of untrusted code
//!
//! isolab creates short-lived, locked-down containers, copies a codebase
//! into them and runs analysis workflows against it. Anything that looks
//! like an attempt to leave the sandbox ends the environment on the spot.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use isolab::sandbox::{AnalysisConfiguration, DockerRuntime, ManagerOptions, SecurityConfiguration};
//! use isolab::service::AssessmentService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Arc::new(DockerRuntime::connect()?);
//!     let service = AssessmentService::new(runtime, ManagerOptions::default(), "workflows")?;
//!
//!     let env = service
//!         .create_environment(SecurityConfiguration::default(), AnalysisConfiguration::default())
//!         .await?;
//!     service.mount_codebase(&env.id, "./app".as_ref(), None).await?;
//!     let result = service.execute_workflow(&env.id, "audit").await?;
//!     println!("{} steps executed", result.executed_steps.len());
//!
//!     service.destroy_environment(&env.id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sandbox`] - runtime seam, security policy, monitoring, gatekeeping and the environment lifecycle
//! - [`resilience`] - retry with backoff, circuit breaker, checkpoints and recovery
//! - [`workflow`] - workflow definitions, conditions, tool adapters and the orchestrator
//! - [`service`] - the public operations surface
//! - [`config`] - JSON configuration
//!
//! ## Security
//!
//! Every sandbox is created with all capabilities dropped, `no-new-privileges`,
//! pid, memory and cpu caps, and no network unless hosts are explicitly
//! allowed. Source trees are scanned for dangerous
//! signatures before they reach the container and checked for setuid files
//! after. Security violations are never retried: the environment is killed,
//! removed and an alert is raised.

pub mod cli;
pub mod config;
pub mod logging;
pub mod resilience;
pub mod sandbox;
pub mod service;
pub mod workflow;
