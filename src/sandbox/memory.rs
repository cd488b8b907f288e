// In-process container runtime
//
// Simulates containers, networks and images in memory. Used for dry runs and
// as the injected runtime in tests: every call is recorded, failures can be
// injected per operation and exec output can be scripted.

use super::error::{AssessmentError, Result};
use super::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ExecChunk, ExecOutput, ExecStream,
    HostCapacity, ImageDetails, NetworkSpec, ResourceUpdate,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Scripted exec behaviour: `(container, argv) -> output`
pub type ExecHandler = Arc<dyn Fn(&str, &[String]) -> ExecOutput + Send + Sync>;

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    networks: Vec<String>,
    memory_bytes: u64,
    nano_cpus: u64,
    files: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, NetworkSpec>,
    images: HashMap<String, ImageDetails>,
    calls: Vec<String>,
    failures: HashMap<String, u32>,
}

/// In-memory [`ContainerRuntime`]
pub struct InMemoryRuntime {
    state: Mutex<State>,
    exec_handler: Mutex<Option<ExecHandler>>,
    capacity: Mutex<HostCapacity>,
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            exec_handler: Mutex::new(None),
            capacity: Mutex::new(HostCapacity {
                cpus: 16.0,
                memory_bytes: 64 * 1024 * 1024 * 1024,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_host_capacity(&self, capacity: HostCapacity) {
        *self
            .capacity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = capacity;
    }

    /// Make the next `times` calls of `operation` fail.
    ///
    /// Operation names match the recorded call prefixes: `create`, `start`,
    /// `stop`, `kill`, `remove`, `inspect`, `update`, `exec`, `upload`,
    /// `create_network`, `connect`, `disconnect`, `remove_network`, `pull`,
    /// `inspect_image`, `remove_image`, `host_capacity`.
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.lock().failures.insert(operation.to_string(), times);
    }

    pub fn set_exec_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &[String]) -> ExecOutput + Send + Sync + 'static,
    {
        *self
            .exec_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));
    }

    /// Every call made so far, as `operation:target`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{}:", operation);
        self.lock()
            .calls
            .iter()
            .filter(|call| call.starts_with(&prefix))
            .count()
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    pub fn network_exists(&self, name: &str) -> bool {
        self.lock().networks.contains_key(name)
    }

    pub fn network_spec(&self, name: &str) -> Option<NetworkSpec> {
        self.lock().networks.get(name).cloned()
    }

    /// Paths uploaded into a container
    pub fn files(&self, id: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .lock()
            .containers
            .get(id)
            .map(|c| c.files.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Attach a container to a network directly, bypassing recording.
    pub fn attach_network(&self, id: &str, network: &str) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.networks.push(network.to_string());
        }
    }

    pub fn add_image(&self, image: &str, details: ImageDetails) {
        self.lock().images.insert(image.to_string(), details);
    }

    pub fn image_exists(&self, image: &str) -> bool {
        self.lock().images.contains_key(image)
    }

    fn record(&self, operation: &str, target: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{}:{}", operation, target));
        if let Some(remaining) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(injected(operation, target));
            }
        }
        Ok(())
    }

    fn run_handler(&self, id: &str, cmd: &[String]) -> ExecOutput {
        let handler = self
            .exec_handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(id, cmd),
            None => ExecOutput::default(),
        }
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.container_exists(id) {
            Ok(())
        } else {
            Err(AssessmentError::NotFound(id.to_string()))
        }
    }
}

fn injected(operation: &str, target: &str) -> AssessmentError {
    let message = format!("injected {} failure for {}", operation, target);
    match operation {
        "create" => AssessmentError::ContainerCreation(message),
        "start" | "inspect" => AssessmentError::ContainerStart(message),
        "stop" | "kill" => AssessmentError::ContainerStop(message),
        "remove" => AssessmentError::ContainerDestroy(message),
        "update" | "host_capacity" => AssessmentError::ResourceAllocation(message),
        "create_network" | "connect" | "disconnect" | "remove_network" | "pull" => {
            AssessmentError::Network(message)
        }
        "inspect_image" | "remove_image" => AssessmentError::ExternalResource(message),
        _ => AssessmentError::AnalysisFailed(message),
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create", &spec.name)?;
        let mut state = self.lock();
        if state.containers.contains_key(&spec.name) {
            return Err(AssessmentError::ContainerCreation(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                networks: vec![spec.network_mode.clone()],
                memory_bytes: spec.memory_bytes,
                nano_cpus: spec.nano_cpus,
                files: HashMap::new(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record("start", id)?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| AssessmentError::ContainerStart(format!("no such container {}", id)))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.record("stop", id)?;
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.record("kill", id)?;
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<()> {
        self.record("remove", id)?;
        self.lock().containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        self.record("inspect", id)?;
        let state = self.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| AssessmentError::NotFound(id.to_string()))?;
        Ok(ContainerDetails {
            id: id.to_string(),
            running: container.running,
            status: if container.running { "running" } else { "exited" }.to_string(),
            network_mode: container.spec.network_mode.clone(),
            networks: container.networks.clone(),
            memory_bytes: Some(container.memory_bytes),
            nano_cpus: Some(container.nano_cpus),
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            privileged: false,
        })
    }

    async fn update_resources(&self, id: &str, update: &ResourceUpdate) -> Result<()> {
        self.record("update", id)?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| AssessmentError::NotFound(id.to_string()))?;
        container.memory_bytes = update.memory_bytes;
        container.nano_cpus = update.nano_cpus;
        Ok(())
    }

    async fn exec(&self, id: &str, cmd: &[String], _timeout: Duration) -> Result<ExecOutput> {
        self.record("exec", id)?;
        self.require(id)?;
        Ok(self.run_handler(id, cmd))
    }

    async fn exec_stream(&self, id: &str, cmd: &[String]) -> Result<ExecStream> {
        self.record("exec_stream", id)?;
        self.require(id)?;
        let output = self.run_handler(id, cmd);
        let mut chunks: Vec<Result<ExecChunk>> = output
            .stdout
            .chunks(64 * 1024)
            .map(|chunk| Ok(ExecChunk::Stdout(chunk.to_vec())))
            .collect();
        if !output.stderr.is_empty() {
            chunks.push(Ok(ExecChunk::Stderr(output.stderr)));
        }
        Ok(stream::iter(chunks).boxed())
    }

    async fn upload_file(&self, id: &str, path: &str, contents: Vec<u8>) -> Result<()> {
        self.record("upload", &format!("{}{}", id, path))?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| AssessmentError::NotFound(id.to_string()))?;
        container.files.insert(path.to_string(), contents);
        Ok(())
    }

    async fn host_capacity(&self) -> Result<HostCapacity> {
        self.record("host_capacity", "host")?;
        Ok(*self
            .capacity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        self.record("create_network", &spec.name)?;
        let mut state = self.lock();
        if state.networks.contains_key(&spec.name) {
            return Err(AssessmentError::Network(format!(
                "network {} already exists",
                spec.name
            )));
        }
        state.networks.insert(spec.name.clone(), spec.clone());
        Ok(spec.name.clone())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        self.record("connect", &format!("{}@{}", container, network))?;
        let mut state = self.lock();
        if !state.networks.contains_key(network) && network != "bridge" {
            return Err(AssessmentError::Network(format!("no such network {}", network)));
        }
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| AssessmentError::NotFound(container.to_string()))?;
        entry.networks.retain(|n| n != "none");
        if !entry.networks.iter().any(|n| n == network) {
            entry.networks.push(network.to_string());
        }
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str, _force: bool) -> Result<()> {
        self.record("disconnect", &format!("{}@{}", container, network))?;
        let mut state = self.lock();
        let entry = state
            .containers
            .get_mut(container)
            .ok_or_else(|| AssessmentError::NotFound(container.to_string()))?;
        entry.networks.retain(|n| n != network);
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<()> {
        self.record("remove_network", network)?;
        self.lock().networks.remove(network);
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record("pull", image)?;
        self.lock()
            .images
            .entry(image.to_string())
            .or_insert_with(|| ImageDetails {
                id: format!("sha256:{}", image.len()),
                repo_digests: Vec::new(),
            });
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails> {
        self.record("inspect_image", image)?;
        self.lock()
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| AssessmentError::NotFound(image.to_string()))
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.record("remove_image", image)?;
        self.lock().images.remove(image);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "ubuntu:22.04".to_string(),
            network_mode: "none".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            disk_bytes: 1024 * 1024 * 1024,
            pids_limit: 256,
            working_dir: "/workspace".to_string(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_is_recorded() {
        let runtime = InMemoryRuntime::new();
        let id = runtime.create_container(&spec("box-1")).await.unwrap();
        runtime.start_container(&id).await.unwrap();
        assert!(runtime.inspect_container(&id).await.unwrap().running);

        runtime.remove_container(&id, true).await.unwrap();
        assert!(!runtime.container_exists(&id));
        assert_eq!(runtime.call_count("create"), 1);
        assert_eq!(runtime.call_count("remove"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let runtime = InMemoryRuntime::new();
        runtime.fail_next("create", 1);

        let first = runtime.create_container(&spec("box-2")).await;
        assert!(matches!(first, Err(AssessmentError::ContainerCreation(_))));
        assert!(runtime.create_container(&spec("box-2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_exec_handler_scripts_output() {
        let runtime = InMemoryRuntime::new();
        runtime.create_container(&spec("box-3")).await.unwrap();
        runtime.set_exec_handler(|_, cmd| ExecOutput {
            exit_code: if cmd.iter().any(|a| a.contains("fail")) { 1 } else { 0 },
            stdout: b"ok".to_vec(),
            ..Default::default()
        });

        let ok = runtime
            .exec("box-3", &["true".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout_lossy(), "ok");

        let bad = runtime
            .exec("box-3", &["fail".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!bad.success());
    }

    #[tokio::test]
    async fn test_connect_replaces_none_network() {
        let runtime = InMemoryRuntime::new();
        runtime.create_container(&spec("box-4")).await.unwrap();
        runtime
            .create_network(&NetworkSpec::internal_bridge("net-4"))
            .await
            .unwrap();
        runtime.connect_network("net-4", "box-4").await.unwrap();

        let details = runtime.inspect_container("box-4").await.unwrap();
        assert_eq!(details.networks, vec!["net-4".to_string()]);
    }
}
