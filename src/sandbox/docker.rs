// Docker-backed container runtime (bollard)

use super::error::{AssessmentError, Result};
use super::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ExecChunk, ExecOutput, ExecStream,
    HostCapacity, ImageDetails, NetworkSpec, ResourceUpdate,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{CreateImageOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

/// Runtime talking to the local Docker daemon.
///
/// Containers are created with every capability dropped, `no-new-privileges`,
/// a pids cap and a noexec `/tmp`. The disk cap is only submitted as a
/// storage option when `storage_quota` is enabled, since most storage drivers
/// reject it.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    storage_quota: bool,
}

impl DockerRuntime {
    /// Connect using the platform defaults (socket or named pipe)
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            AssessmentError::ContainerCreation(format!("Failed to connect to Docker: {}", e))
        })?;
        Ok(Self {
            docker,
            storage_quota: false,
        })
    }

    pub fn with_storage_quota(mut self, enabled: bool) -> Self {
        self.storage_quota = enabled;
        self
    }

    fn host_config(&self, spec: &ContainerSpec) -> HostConfig {
        let storage_opt = if self.storage_quota && spec.disk_bytes > 0 {
            Some(HashMap::from([("size".to_string(), spec.disk_bytes.to_string())]))
        } else {
            None
        };

        HostConfig {
            network_mode: Some(spec.network_mode.clone()),
            memory: Some(spec.memory_bytes as i64),
            memory_swap: Some(spec.memory_bytes as i64),
            nano_cpus: Some(spec.nano_cpus as i64),
            pids_limit: Some(spec.pids_limit as i64),
            storage_opt,
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec![]),
            privileged: Some(false),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=64m".to_string(),
            )])),
            ..Default::default()
        }
    }

    async fn collect_exec(&self, exec_id: &str, output: ExecStreamRaw) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut output = output;
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                Ok(_) => {}
                Err(e) => {
                    return Err(AssessmentError::AnalysisFailed(format!(
                        "exec {} output stream failed: {}",
                        exec_id, e
                    )))
                }
            }
        }
        Ok((stdout, stderr))
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        let inspect = self.docker.inspect_exec(exec_id).await.map_err(|e| {
            AssessmentError::AnalysisFailed(format!("Failed to inspect exec: {}", e))
        })?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

type ExecStreamRaw = std::pin::Pin<
    Box<dyn futures_util::Stream<Item = std::result::Result<LogOutput, DockerError>> + Send>,
>;

fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn not_found(err: &DockerError) -> bool {
    is_status(err, 404)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(self.host_config(spec)),
            working_dir: Some(spec.working_dir.clone()),
            labels: Some(spec.labels.clone()),
            // Keep container running with a sleep command
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            network_disabled: Some(spec.network_mode == "none"),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| {
                AssessmentError::ContainerCreation(format!("Failed to create container: {}", e))
            })?;
        debug!(container = %container.id, image = %spec.image, "Container created");
        Ok(container.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| AssessmentError::ContainerStart(format!("Failed to start container: {}", e)))
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(AssessmentError::ContainerStop(format!(
                "Failed to stop container: {}",
                e
            ))),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 409) || not_found(&e) => Ok(()),
            Err(e) => Err(AssessmentError::ContainerStop(format!(
                "Failed to kill container: {}",
                e
            ))),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(AssessmentError::ContainerDestroy(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetails> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if not_found(&e) {
                    AssessmentError::NotFound(id.to_string())
                } else {
                    AssessmentError::ContainerStart(format!("Failed to inspect container: {}", e))
                }
            })?;

        let state = info.state.unwrap_or_default();
        let host = info.host_config.unwrap_or_default();
        let networks = info
            .network_settings
            .and_then(|settings| settings.networks)
            .map(|networks| networks.into_keys().collect())
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: info.id.unwrap_or_else(|| id.to_string()),
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|s| format!("{:?}", s).to_lowercase())
                .unwrap_or_default(),
            network_mode: host.network_mode.unwrap_or_default(),
            networks,
            memory_bytes: host.memory.filter(|m| *m > 0).map(|m| m as u64),
            nano_cpus: host.nano_cpus.filter(|c| *c > 0).map(|c| c as u64),
            cap_drop: host.cap_drop.unwrap_or_default(),
            security_opt: host.security_opt.unwrap_or_default(),
            privileged: host.privileged.unwrap_or(false),
        })
    }

    async fn update_resources(&self, id: &str, update: &ResourceUpdate) -> Result<()> {
        let options = UpdateContainerOptions::<String> {
            memory: Some(update.memory_bytes as i64),
            memory_swap: Some(update.memory_bytes as i64),
            nano_cpus: Some(update.nano_cpus as i64),
            ..Default::default()
        };
        self.docker
            .update_container(id, options)
            .await
            .map_err(|e| AssessmentError::ResourceAllocation(format!("Failed to update limits: {}", e)))
    }

    async fn exec(&self, id: &str, cmd: &[String], timeout: Duration) -> Result<ExecOutput> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.as_str()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| AssessmentError::AnalysisFailed(format!("Failed to create exec: {}", e)))?;

        let start = Instant::now();
        let run = async {
            match self.docker.start_exec(&exec.id, None).await {
                Ok(StartExecResults::Attached { output, .. }) => {
                    self.collect_exec(&exec.id, output).await
                }
                Ok(StartExecResults::Detached) => Err(AssessmentError::AnalysisFailed(
                    "Unexpected detached exec".to_string(),
                )),
                Err(e) => Err(AssessmentError::AnalysisFailed(format!("Exec failed: {}", e))),
            }
        };

        let (stdout, stderr) = tokio_timeout(timeout, run).await.map_err(|_| {
            AssessmentError::Timeout(format!("command {:?} exceeded {:?}", cmd.first(), timeout))
        })??;

        Ok(ExecOutput {
            exit_code: self.exit_code(&exec.id).await?,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn exec_stream(&self, id: &str, cmd: &[String]) -> Result<ExecStream> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.iter().map(|s| s.as_str()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| AssessmentError::AnalysisFailed(format!("Failed to create exec: {}", e)))?;

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { output, .. }) => Ok(output
                .filter_map(|chunk| async move {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => Some(Ok(ExecChunk::Stdout(message.to_vec()))),
                        Ok(LogOutput::StdErr { message }) => Some(Ok(ExecChunk::Stderr(message.to_vec()))),
                        Ok(_) => None,
                        Err(e) => Some(Err(AssessmentError::Network(format!(
                            "exec stream failed: {}",
                            e
                        )))),
                    }
                })
                .boxed()),
            Ok(StartExecResults::Detached) => Err(AssessmentError::AnalysisFailed(
                "Unexpected detached exec".to_string(),
            )),
            Err(e) => Err(AssessmentError::AnalysisFailed(format!("Exec failed: {}", e))),
        }
    }

    async fn upload_file(&self, id: &str, path: &str, contents: Vec<u8>) -> Result<()> {
        let script = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;
        let exec_config = CreateExecOptions {
            cmd: Some(vec!["sh", "-c", script, "upload", path]),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_config)
            .await
            .map_err(|e| AssessmentError::AnalysisFailed(format!("Failed to create exec: {}", e)))?;

        match self.docker.start_exec(&exec.id, None).await {
            Ok(StartExecResults::Attached { output, mut input }) => {
                input.write_all(&contents).await?;
                input.shutdown().await?;
                drop(input);
                let (_, stderr) = self.collect_exec(&exec.id, output).await?;
                let code = self.exit_code(&exec.id).await?;
                if code != 0 {
                    return Err(AssessmentError::AnalysisFailed(format!(
                        "upload of {} failed ({}): {}",
                        path,
                        code,
                        String::from_utf8_lossy(&stderr)
                    )));
                }
                Ok(())
            }
            Ok(StartExecResults::Detached) => Err(AssessmentError::AnalysisFailed(
                "Unexpected detached exec".to_string(),
            )),
            Err(e) => Err(AssessmentError::AnalysisFailed(format!("Upload failed: {}", e))),
        }
    }

    async fn host_capacity(&self) -> Result<HostCapacity> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| AssessmentError::ResourceAllocation(format!("Failed to query host: {}", e)))?;
        Ok(HostCapacity {
            cpus: info.ncpu.map(|n| n as f64).unwrap_or_else(|| num_cpus::get() as f64),
            memory_bytes: info.mem_total.unwrap_or(0).max(0) as u64,
        })
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let options = HashMap::from([
            (
                "com.docker.network.bridge.enable_icc".to_string(),
                spec.enable_icc.to_string(),
            ),
            (
                "com.docker.network.bridge.enable_ip_masquerade".to_string(),
                spec.enable_ip_masquerade.to_string(),
            ),
        ]);
        let config = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            internal: spec.internal,
            options,
            labels: spec.labels.clone(),
            ..Default::default()
        };
        self.docker
            .create_network(config)
            .await
            .map_err(|e| AssessmentError::Network(format!("Failed to create network {}: {}", spec.name, e)))?;
        Ok(spec.name.clone())
    }

    async fn connect_network(&self, network: &str, container: &str) -> Result<()> {
        let config = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker
            .connect_network(network, config)
            .await
            .map_err(|e| AssessmentError::Network(format!("Failed to connect {} to {}: {}", container, network, e)))
    }

    async fn disconnect_network(&self, network: &str, container: &str, force: bool) -> Result<()> {
        let config = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        self.docker
            .disconnect_network(network, config)
            .await
            .map_err(|e| {
                AssessmentError::Network(format!(
                    "Failed to disconnect {} from {}: {}",
                    container, network, e
                ))
            })
    }

    async fn remove_network(&self, network: &str) -> Result<()> {
        match self.docker.remove_network(network).await {
            Ok(()) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(AssessmentError::Network(format!(
                "Failed to remove network {}: {}",
                network, e
            ))),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            item.map_err(|e| AssessmentError::Network(format!("Failed to pull {}: {}", image, e)))?;
        }
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageDetails> {
        let info = self.docker.inspect_image(image).await.map_err(|e| {
            if not_found(&e) {
                AssessmentError::NotFound(image.to_string())
            } else {
                AssessmentError::ExternalResource(format!("Failed to inspect {}: {}", image, e))
            }
        })?;
        Ok(ImageDetails {
            id: info.id.unwrap_or_default(),
            repo_digests: info.repo_digests.unwrap_or_default(),
        })
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_image(image, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(AssessmentError::ExternalResource(format!(
                "Failed to remove image {}: {}",
                image, e
            ))),
        }
    }
}
