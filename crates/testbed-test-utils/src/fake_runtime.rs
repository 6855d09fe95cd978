//! In-memory container runtime.
//!
//! `FakeRuntime` records every call and keeps track of which containers are
//! running, so tests can assert that a failed Setup leaves nothing behind.
//! Failures are scripted per service name.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use testbed::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, RuntimeError};

/// First host port handed out for dynamically published ports.
pub const FIRST_DYNAMIC_PORT: u16 = 40000;

/// A recorded runtime call. Container calls carry the service name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    CreateNetwork(String),
    /// Carries the image reference.
    EnsureImage(String),
    StartContainer(String),
    WaitRunning(String),
    Exec(String),
    Logs(String),
    StopContainer(String),
    RemoveNetwork(String),
}

#[derive(Debug)]
struct FakeContainer {
    service: String,
    spec: ContainerSpec,
    running: bool,
    ports: BTreeMap<u16, u16>,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u32,
    next_port: u16,
    containers: HashMap<String, FakeContainer>,
    networks: HashMap<String, String>,
    calls: Vec<RuntimeCall>,
    start_failures: HashMap<String, String>,
    exits: HashMap<String, Option<i64>>,
    slow_starts: HashSet<String>,
    logs: HashMap<String, String>,
    exec_outputs: HashMap<String, ExecOutput>,
    stop_failures: HashSet<String>,
    network_failure: Option<String>,
}

/// Scriptable [`ContainerRuntime`] that never touches a real engine.
#[derive(Debug)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_port: FIRST_DYNAMIC_PORT,
                ..FakeState::default()
            }),
        }
    }

    /// `start_container` for `service` fails with `reason`.
    pub fn fail_start(&self, service: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .start_failures
            .insert(service.to_string(), reason.to_string());
    }

    /// The container for `service` starts but exits before reporting running.
    pub fn exit_on_start(&self, service: &str, exit_code: i64) {
        self.state
            .lock()
            .unwrap()
            .exits
            .insert(service.to_string(), Some(exit_code));
    }

    /// The container for `service` never reports running; `wait_running`
    /// only returns once its timeout has elapsed.
    pub fn hang_on_start(&self, service: &str) {
        self.state
            .lock()
            .unwrap()
            .slow_starts
            .insert(service.to_string());
    }

    /// Log output returned for the container of `service`. Also attached to
    /// a scripted start failure.
    pub fn set_logs(&self, service: &str, logs: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(service.to_string(), logs.to_string());
    }

    /// Output of every command executed in the container of `service`.
    pub fn set_exec_output(&self, service: &str, exit_code: i64, output: &str) {
        self.state.lock().unwrap().exec_outputs.insert(
            service.to_string(),
            ExecOutput {
                exit_code,
                output: output.to_string(),
            },
        );
    }

    /// Stopping the container of `service` fails; it stays running.
    pub fn fail_stop(&self, service: &str) {
        self.state
            .lock()
            .unwrap()
            .stop_failures
            .insert(service.to_string());
    }

    pub fn fail_network(&self, reason: &str) {
        self.state.lock().unwrap().network_failure = Some(reason.to_string());
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Services whose containers were started, in start order.
    pub fn started_services(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::StartContainer(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Services whose containers were stopped, in stop order.
    pub fn stopped_services(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RuntimeCall::StopContainer(service) => Some(service),
                _ => None,
            })
            .collect()
    }

    /// Services with a container that exists and is running.
    pub fn running_services(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut running: Vec<String> = state
            .containers
            .values()
            .filter(|c| c.running)
            .map(|c| c.service.clone())
            .collect();
        running.sort();
        running
    }

    /// Containers that still exist, running or not.
    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn network_count(&self) -> usize {
        self.state.lock().unwrap().networks.len()
    }

    /// Spec the container of `service` was started with.
    pub fn spec_for(&self, service: &str) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.service == service)
            .map(|c| c.spec.clone())
    }

    fn record(&self, call: RuntimeCall) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn service_of(&self, container_id: &str) -> Result<String, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .map(|c| c.service.clone())
            .ok_or_else(|| RuntimeError::UnknownContainer(container_id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn host(&self) -> &str {
        "127.0.0.1"
    }

    async fn create_network(
        &self,
        name: &str,
        _labels: &BTreeMap<String, String>,
    ) -> Result<String, RuntimeError> {
        self.record(RuntimeCall::CreateNetwork(name.to_string()));
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.network_failure {
            return Err(RuntimeError::Api(reason.clone()));
        }
        let id = format!("net-{name}");
        state.networks.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::EnsureImage(image.to_string()));
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(RuntimeCall::StartContainer(spec.service.clone()));
        let mut state = self.state.lock().unwrap();

        if let Some(reason) = state.start_failures.get(&spec.service) {
            return Err(RuntimeError::StartFailed {
                reason: reason.clone(),
                logs: state.logs.get(&spec.service).cloned(),
            });
        }
        if !state.networks.values().any(|n| *n == spec.network) {
            return Err(RuntimeError::Api(format!("network {} not found", spec.network)));
        }

        state.next_id += 1;
        let id = format!("fake-{}-{}", spec.service, state.next_id);

        let mut ports = BTreeMap::new();
        for port in &spec.ports {
            let host_port = match port.host {
                Some(fixed) => fixed,
                None => {
                    state.next_port += 1;
                    state.next_port
                }
            };
            ports.insert(port.container, host_port);
        }

        let running = !state.exits.contains_key(&spec.service);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                service: spec.service.clone(),
                spec: spec.clone(),
                running,
                ports,
            },
        );
        Ok(id)
    }

    async fn wait_running(&self, container_id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let service = self.service_of(container_id)?;
        self.record(RuntimeCall::WaitRunning(service.clone()));

        let slow = self.state.lock().unwrap().slow_starts.contains(&service);
        if slow {
            tokio::time::sleep(timeout).await;
            return Err(RuntimeError::StartTimeout(timeout));
        }

        let state = self.state.lock().unwrap();
        match state.exits.get(&service) {
            Some(exit_code) => Err(RuntimeError::Exited {
                exit_code: *exit_code,
            }),
            None => Ok(()),
        }
    }

    async fn mapped_port(&self, container_id: &str, container_port: u16) -> Result<u16, RuntimeError> {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(container_id)
            .and_then(|c| c.ports.get(&container_port).copied())
            .ok_or(RuntimeError::PortNotPublished(container_port))
    }

    async fn exec(&self, container_id: &str, _command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let service = self.service_of(container_id)?;
        self.record(RuntimeCall::Exec(service.clone()));
        Ok(self
            .state
            .lock()
            .unwrap()
            .exec_outputs
            .get(&service)
            .cloned()
            .unwrap_or(ExecOutput {
                exit_code: 0,
                output: String::new(),
            }))
    }

    async fn logs(&self, container_id: &str) -> Result<String, RuntimeError> {
        let service = self.service_of(container_id)?;
        self.record(RuntimeCall::Logs(service.clone()));
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(&service)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RuntimeError> {
        let service = self.service_of(container_id)?;
        self.record(RuntimeCall::StopContainer(service.clone()));
        let mut state = self.state.lock().unwrap();
        if state.stop_failures.contains(&service) {
            return Err(RuntimeError::Api(format!("cannot stop {service}")));
        }
        state.containers.remove(container_id);
        Ok(())
    }

    async fn remove_network(&self, network_id: &str) -> Result<(), RuntimeError> {
        self.record(RuntimeCall::RemoveNetwork(network_id.to_string()));
        self.state
            .lock()
            .unwrap()
            .networks
            .remove(network_id)
            .map(drop)
            .ok_or_else(|| RuntimeError::Api(format!("network {network_id} not found")))
    }
}
