// Container runtime seam
//
// Every sandbox operation goes through `ContainerRuntime`. The Docker-backed
// implementation lives in `docker.rs`, the in-process one in `memory.rs`.

use super::error::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything needed to create a sandbox container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network_mode: String,
    pub memory_bytes: u64,
    pub nano_cpus: u64,
    pub disk_bytes: u64,
    pub pids_limit: u64,
    pub working_dir: String,
    pub labels: HashMap<String, String>,
}

/// Live resource update for a running container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUpdate {
    pub memory_bytes: u64,
    pub nano_cpus: u64,
}

/// Network to create for a sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    /// No route to the outside world
    pub internal: bool,
    pub enable_icc: bool,
    pub enable_ip_masquerade: bool,
    pub labels: HashMap<String, String>,
}

impl NetworkSpec {
    /// Private bridge network with no egress and no inter-container traffic.
    pub fn internal_bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            internal: true,
            enable_icc: false,
            enable_ip_masquerade: false,
            labels: HashMap::new(),
        }
    }
}

/// Snapshot of a container as reported by the runtime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDetails {
    pub id: String,
    pub running: bool,
    pub status: String,
    pub network_mode: String,
    pub networks: Vec<String>,
    pub memory_bytes: Option<u64>,
    pub nano_cpus: Option<u64>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDetails {
    pub id: String,
    pub repo_digests: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub cpus: f64,
    pub memory_bytes: u64,
}

/// Buffered result of a command executed inside a sandbox
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// One chunk of streamed exec output
#[derive(Debug, Clone, PartialEq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type ExecStream = BoxStream<'static, Result<ExecChunk>>;

/// Container-management API the core depends on.
///
/// Implementations map their own failures onto `AssessmentError`
/// variants so that retry classification works uniformly.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Graceful stop; the runtime kills the container once `timeout` elapses.
    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn kill_container(&self, id: &str) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails>;

    async fn update_resources(&self, id: &str, update: &ResourceUpdate) -> Result<()>;

    /// Run a command and collect its output. Exceeding `timeout` yields
    /// `AssessmentError::Timeout`.
    async fn exec(&self, id: &str, cmd: &[String], timeout: Duration) -> Result<ExecOutput>;

    /// Run a command and stream its output. Dropping the stream abandons
    /// the command.
    async fn exec_stream(&self, id: &str, cmd: &[String]) -> Result<ExecStream>;

    /// Write `contents` to `path` inside the container, creating parents.
    async fn upload_file(&self, id: &str, path: &str, contents: Vec<u8>) -> Result<()>;

    async fn host_capacity(&self) -> Result<HostCapacity>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn connect_network(&self, network: &str, container: &str) -> Result<()>;

    async fn disconnect_network(&self, network: &str, container: &str, force: bool) -> Result<()>;

    async fn remove_network(&self, network: &str) -> Result<()>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails>;

    async fn remove_image(&self, image: &str) -> Result<()>;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// `sh -c <script>` as an argv vector
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

/// Single-quote `value` for safe interpolation into a shell script.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
