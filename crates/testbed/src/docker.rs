//! Docker Engine implementation of [`ContainerRuntime`].
//!
//! Talks to the local daemon through `bollard`. Images are pulled only when
//! missing locally; containers join the run network under their alias and
//! publish their exposed ports on the host.

use crate::descriptor::PortSpec;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, EndpointSettings, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Host through which published ports are reached on a local daemon.
pub const DEFAULT_HOST: &str = "localhost";

/// Grace period given to a container on stop before it is killed.
const STOP_GRACE_SECS: i64 = 10;

const RUNNING_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct DockerRuntime {
    docker: Docker,
    host: String,
}

impl DockerRuntime {
    /// Connect to the local daemon (`DOCKER_HOST` or the default socket)
    /// and verify it answers.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        info!(target: "testbed.docker", "Connected to Docker daemon");
        Ok(Self {
            docker,
            host: DEFAULT_HOST.to_string(),
        })
    }

    /// Reach published ports through a different host (remote daemons).
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(api_error)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn host(&self) -> &str {
        &self.host
    }

    #[instrument(skip_all, name = "testbed.docker.create_network", fields(network = %name))]
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let labels: HashMap<&str, &str> = labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            labels,
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(api_error)?;
        if response.id.is_empty() {
            return Err(RuntimeError::Api(format!(
                "network {name} created without an id"
            )));
        }

        info!(target: "testbed.docker", network = %name, id = %response.id, "Created network");
        Ok(response.id)
    }

    #[instrument(skip_all, name = "testbed.docker.ensure_image", fields(image = %image))]
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(api_error(e)),
        }

        let reference = with_default_tag(image);
        info!(target: "testbed.docker", image = %reference, "Pulling image");

        let options = CreateImageOptions {
            from_image: reference.as_str(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(target: "testbed.docker", image = %reference, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::ImagePull {
                        image: reference.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    #[instrument(skip_all, name = "testbed.docker.start_container", fields(service = %spec.service))]
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let labels: HashMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| (port_key(p.container), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> =
            spec.ports.iter().map(port_binding).collect();

        let endpoint = EndpointSettings {
            aliases: Some(vec![spec.alias.clone()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                network_mode: Some(spec.network.clone()),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: HashMap::from([(spec.network.clone(), endpoint)]),
            }),
            ..Default::default()
        };

        let name = format!("{}-{}", spec.network, spec.service);
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(api_error)?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            let reason = api_error(e).to_string();
            let logs = self.logs(&response.id).await.ok();

            // Never leave a created-but-unstarted container behind.
            if let Err(remove_err) = self.remove(&response.id).await {
                warn!(
                    target: "testbed.docker",
                    container = %name,
                    id = %response.id,
                    error = %remove_err,
                    "Failed to remove container that did not start"
                );
            }
            return Err(RuntimeError::StartFailed { reason, logs });
        }

        info!(
            target: "testbed.docker",
            container = %name,
            id = %response.id,
            "Started container"
        );
        Ok(response.id)
    }

    async fn wait_running(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let poll = async {
            loop {
                let inspect = self
                    .docker
                    .inspect_container(container_id, None::<InspectContainerOptions>)
                    .await
                    .map_err(api_error)?;

                if let Some(state) = inspect.state {
                    if state.running == Some(true) {
                        return Ok(());
                    }
                    if matches!(
                        state.status,
                        Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD)
                    ) {
                        return Err(RuntimeError::Exited {
                            exit_code: state.exit_code,
                        });
                    }
                }

                tokio::time::sleep(RUNNING_POLL_INTERVAL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| RuntimeError::StartTimeout(timeout))?
    }

    async fn mapped_port(&self, container_id: &str, container_port: u16) -> Result<u16, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(api_error)?;

        inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&port_key(container_port)))
            .flatten()
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            })
            .ok_or(RuntimeError::PortNotPublished(container_port))
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        debug!(target: "testbed.docker", container = %container_id, cmd = ?command, "Executing command");

        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(api_error)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(api_error)?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message } | LogOutput::StdErr { message }) => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(api_error(e)),
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(api_error)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output,
        })
    }

    async fn logs(&self, container_id: &str) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk.map_err(api_error)?.to_string());
        }
        Ok(output)
    }

    #[instrument(skip_all, name = "testbed.docker.stop_container", fields(container = %container_id))]
    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(container_id, Some(options)).await {
            // 304: already stopped
            Ok(())
            | Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => {
                debug!(target: "testbed.docker", error = %e, "Stop failed, forcing removal");
            }
        }

        self.remove(container_id).await?;
        info!(target: "testbed.docker", container = %container_id, "Removed container");
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_network(network_id)
            .await
            .map_err(api_error)?;
        info!(target: "testbed.docker", network = %network_id, "Removed network");
        Ok(())
    }
}

fn api_error(error: DockerError) -> RuntimeError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::UnknownContainer(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api(format!("{status_code}: {message}")),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

fn port_key(container_port: u16) -> String {
    format!("{container_port}/tcp")
}

fn port_binding(port: &PortSpec) -> (String, Option<Vec<PortBinding>>) {
    let binding = PortBinding {
        host_ip: None,
        host_port: Some(port.host.map(|p| p.to_string()).unwrap_or_default()),
    };
    (port_key(port.container), Some(vec![binding]))
}

/// `name` → `name:latest`; references with a tag or digest are unchanged.
fn with_default_tag(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || image.contains('@') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}
