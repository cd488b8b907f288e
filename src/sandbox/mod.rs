// Assessment sandbox module
//
// Container-backed environments for running analysis tools against
// untrusted code: the runtime seam, security policy, network monitoring,
// resource gatekeeping and the environment lifecycle.

pub mod alerts;
pub mod docker;
pub mod error;
pub mod gatekeeper;
pub mod manager;
pub mod memory;
pub mod network_monitor;
pub mod runtime;
pub mod scanner;
pub mod security;
pub mod types;

pub use alerts::{AlertBus, AlertKind, SecurityAlert};
pub use docker::DockerRuntime;
pub use error::{AssessmentError, ErrorReport, ErrorSeverity, PartialFailure, Result, ViolationKind};
pub use gatekeeper::{
    DownloadOutcome, DownloadRequest, GatekeeperSettings, InstallReport, PackageManager,
    ResourceGatekeeper,
};
pub use manager::{EnvironmentManager, EnvironmentSettings, ManagerOptions, MountReport};
pub use memory::InMemoryRuntime;
pub use network_monitor::{
    MonitorEvent, MonitorSettings, MonitorThresholds, NetworkAction, NetworkActivity,
    NetworkMonitor, Protocol, SuspiciousPattern, ThresholdKind,
};
pub use runtime::{ContainerRuntime, SharedRuntime};
pub use scanner::{CodeScanner, ScanFinding};
pub use security::{AppliedLimits, BoundaryReport, SecurityPolicyEngine};
pub use types::*;
