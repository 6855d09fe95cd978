//! Container runtime seam.
//!
//! The provisioner and the describe probe talk to the container engine only
//! through [`ContainerRuntime`]. The Docker implementation lives in
//! [`crate::docker`]; tests substitute a scripted fake.

use crate::descriptor::{PortSpec, ServiceDescriptor};
use async_trait::async_trait;
use common::types::RunId;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Label carrying the run id on every network and container.
pub const RUN_LABEL: &str = "testbed.run";

/// Label carrying the service name on every container.
pub const SERVICE_LABEL: &str = "testbed.service";

/// Container engine errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container engine unavailable: {0}")]
    Unavailable(String),

    #[error("Container engine request failed: {0}")]
    Api(String),

    #[error("Failed to pull image {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Container exited before reporting running (exit code {exit_code:?})")]
    Exited { exit_code: Option<i64> },

    #[error("Container did not report running within {0:?}")]
    StartTimeout(Duration),

    #[error("Container port {0} is not published")]
    PortNotPublished(u16),

    #[error("Unknown container: {0}")]
    UnknownContainer(String),

    #[error("Container failed to start: {reason}")]
    StartFailed {
        reason: String,
        /// Output the container produced before it was removed.
        logs: Option<String>,
    },
}

impl RuntimeError {
    /// Container output captured along with the error, if any.
    pub fn logs(&self) -> Option<&str> {
        match self {
            RuntimeError::StartFailed { logs, .. } => logs.as_deref(),
            _ => None,
        }
    }
}

/// Everything the engine needs to start one service container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub service: String,
    pub image: String,
    /// Name of the shared run network.
    pub network: String,
    /// DNS alias on the shared network.
    pub alias: String,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub ports: Vec<PortSpec>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    /// Build the spec for a descriptor on the run network.
    pub fn for_service(descriptor: &ServiceDescriptor, network: &str, run_id: RunId) -> Self {
        let labels = BTreeMap::from([
            (RUN_LABEL.to_string(), run_id.to_string()),
            (SERVICE_LABEL.to_string(), descriptor.name.clone()),
        ]);

        Self {
            service: descriptor.name.clone(),
            image: descriptor.image.clone(),
            network: network.to_string(),
            alias: descriptor.network_alias.clone(),
            env: descriptor.environment.clone(),
            command: descriptor.command.clone(),
            ports: descriptor.exposed_ports.clone(),
            labels,
        }
    }
}

/// Output of a command executed inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the testbed needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Host address through which published ports are reachable.
    fn host(&self) -> &str;

    /// Create a network and return its id.
    async fn create_network(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError>;

    /// Make `image` available locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a container, returning its id.
    ///
    /// Implementations remove the container again if it was created but
    /// could not be started, so an error never leaves an id behind.
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Wait until the container process reports running.
    async fn wait_running(&self, container_id: &str, timeout: Duration)
        -> Result<(), RuntimeError>;

    /// Host port published for a container port.
    async fn mapped_port(&self, container_id: &str, container_port: u16)
        -> Result<u16, RuntimeError>;

    /// Run a command inside the container.
    async fn exec(&self, container_id: &str, command: &[String])
        -> Result<ExecOutput, RuntimeError>;

    /// Full stdout/stderr log of the container.
    async fn logs(&self, container_id: &str) -> Result<String, RuntimeError>;

    /// Stop and remove the container.
    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError>;

    /// Remove a network created by [`ContainerRuntime::create_network`].
    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError>;
}
