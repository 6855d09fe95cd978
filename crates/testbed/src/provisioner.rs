//! Container provisioning.
//!
//! The [`Provisioner`] walks a [`RunPlan`] in dependency order. For each
//! service that is not remote it starts a container on the run network,
//! waits for the process to report running, resolves published ports and
//! then hands the container to a [`ServiceGate`] before moving on, so a
//! dependent never starts before its dependencies are ready.
//!
//! Provisioning is all-or-nothing. On the first failure every resource
//! created so far is released in reverse order and the error is returned;
//! the caller never sees a partial set of resources. Resources are recorded
//! in a [`ResourceGuard`] as soon as the engine hands back an id, so a
//! provisioning future that is dropped midway still releases them.

use crate::errors::{Result, TeardownError, TestbedError, LOG_TAIL_LINES};
use crate::plan::{Placement, PlannedService, RunPlan};
use crate::registry::{Endpoint, EndpointRegistry, RegistryBuilder};
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError, RUN_LABEL};
use async_trait::async_trait;
use common::types::RunId;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Shared network all containers of a run are attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    /// Stop was attempted; never stopped again.
    Released,
}

/// A container started by this run.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    pub service: String,
    pub container_id: String,
    pub host: String,
    /// Container port → host port.
    pub ports: BTreeMap<u16, u16>,
    pub state: ContainerState,
}

impl ContainerHandle {
    fn started(service: &str, container_id: String, host: &str) -> Self {
        Self {
            service: service.to_string(),
            container_id,
            host: host.to_string(),
            ports: BTreeMap::new(),
            state: ContainerState::Running,
        }
    }
}

/// Decides when a running container may be considered ready.
#[async_trait]
pub trait ServiceGate: Send + Sync {
    async fn ready(
        &self,
        planned: &PlannedService,
        container: &ContainerHandle,
        runtime: &dyn ContainerRuntime,
    ) -> Result<()>;
}

/// Outcome of releasing a run's resources.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub stopped: usize,
    pub network_removed: bool,
    pub failures: Vec<TeardownError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Everything a run owns in the container engine.
#[derive(Debug, Default)]
pub struct Resources {
    network: Option<NetworkHandle>,
    containers: Vec<ContainerHandle>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.network.is_none() && self.containers.is_empty()
    }

    /// Stop containers in reverse start order, then remove the network.
    ///
    /// Each resource is attempted exactly once. Failures are logged and
    /// collected; they never stop the remaining releases.
    #[instrument(skip_all, name = "testbed.provisioner.release")]
    pub async fn release(&mut self, runtime: &dyn ContainerRuntime) -> TeardownReport {
        let mut report = TeardownReport::default();

        for handle in self.containers.iter_mut().rev() {
            if handle.state == ContainerState::Released {
                continue;
            }
            handle.state = ContainerState::Released;

            match runtime.stop_container(&handle.container_id).await {
                Ok(()) => {
                    debug!(
                        target: "testbed.provisioner",
                        service = %handle.service,
                        container_id = %handle.container_id,
                        "Container stopped"
                    );
                    report.stopped += 1;
                }
                Err(source) => {
                    let failure = TeardownError::StopContainer {
                        service: handle.service.clone(),
                        container_id: handle.container_id.clone(),
                        source,
                    };
                    warn!(target: "testbed.provisioner", error = %failure, "Teardown step failed");
                    report.failures.push(failure);
                }
            }
        }

        if let Some(network) = self.network.take() {
            match runtime.remove_network(&network.id).await {
                Ok(()) => {
                    debug!(target: "testbed.provisioner", network = %network.name, "Network removed");
                    report.network_removed = true;
                }
                Err(source) => {
                    let failure = TeardownError::RemoveNetwork {
                        network: network.name,
                        source,
                    };
                    warn!(target: "testbed.provisioner", error = %failure, "Teardown step failed");
                    report.failures.push(failure);
                }
            }
        }

        report
    }
}

/// Release-once ownership of a run's [`Resources`], shared between
/// provisioning and the running testbed.
///
/// When the last clone is dropped while anything is still recorded, a
/// release is scheduled on the current tokio runtime.
#[derive(Clone)]
pub struct ResourceGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    run_id: RunId,
    runtime: Arc<dyn ContainerRuntime>,
    resources: Mutex<Option<Resources>>,
}

impl ResourceGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, run_id: RunId) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                run_id,
                runtime,
                resources: Mutex::new(Some(Resources::default())),
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.inner.run_id
    }

    async fn network_name(&self) -> Option<String> {
        self.inner
            .resources
            .lock()
            .await
            .as_ref()
            .and_then(|r| r.network.as_ref())
            .map(|n| n.name.clone())
    }

    async fn record_network(&self, network: NetworkHandle) {
        if let Some(resources) = self.inner.resources.lock().await.as_mut() {
            resources.network = Some(network);
        }
    }

    async fn record_container(&self, handle: ContainerHandle) {
        if let Some(resources) = self.inner.resources.lock().await.as_mut() {
            resources.containers.push(handle);
        }
    }

    async fn record_ports(&self, handle: &ContainerHandle) {
        if let Some(recorded) = self
            .inner
            .resources
            .lock()
            .await
            .as_mut()
            .and_then(|r| {
                r.containers
                    .iter_mut()
                    .find(|c| c.container_id == handle.container_id)
            })
        {
            recorded.ports = handle.ports.clone();
        }
    }

    async fn container_count(&self) -> usize {
        self.inner
            .resources
            .lock()
            .await
            .as_ref()
            .map_or(0, |r| r.containers.len())
    }

    /// Release everything recorded. Only the first call does any work and
    /// returns a report; later calls return `None`.
    pub async fn release(&self) -> Option<TeardownReport> {
        let mut slot = self.inner.resources.lock().await;
        let resources = slot.as_mut()?;
        let report = resources.release(self.inner.runtime.as_ref()).await;
        *slot = None;
        Some(report)
    }

    pub async fn is_released(&self) -> bool {
        self.inner.resources.lock().await.is_none()
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("run_id", &self.inner.run_id)
            .finish_non_exhaustive()
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        let Some(mut resources) = self.resources.get_mut().take() else {
            return;
        };
        if resources.is_empty() {
            return;
        }

        warn!(
            target: "testbed.provisioner",
            run_id = %self.run_id,
            containers = resources.containers.len(),
            "Resources dropped without release, scheduling teardown"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = Arc::clone(&self.runtime);
                handle.spawn(async move {
                    let report = resources.release(runtime.as_ref()).await;
                    debug!(
                        target: "testbed.provisioner",
                        stopped = report.stopped,
                        failures = report.failures.len(),
                        "Deferred release finished"
                    );
                });
            }
            Err(_) => {
                error!(
                    target: "testbed.provisioner",
                    run_id = %self.run_id,
                    label = RUN_LABEL,
                    "No async runtime to release on; remove containers by label"
                );
            }
        }
    }
}

/// Result of a successful provisioning pass.
#[derive(Debug)]
pub struct Provisioned {
    pub resources: ResourceGuard,
    pub registry: EndpointRegistry,
}

/// Starts the provisioned services of a plan.
pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    run_id: RunId,
    network_prefix: String,
    cancel: CancellationToken,
}

impl Provisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, run_id: RunId, network_prefix: &str) -> Self {
        Self {
            runtime,
            run_id,
            network_prefix: network_prefix.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort between services once `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Name of the run network.
    pub fn network_name(&self) -> String {
        format!("{}-{}", self.network_prefix, self.run_id.short())
    }

    /// Bring up every service of `plan`, gating each one before the next.
    #[instrument(skip_all, name = "testbed.provisioner.provision", fields(run_id = %self.run_id))]
    pub async fn provision(&self, plan: &RunPlan, gate: &dyn ServiceGate) -> Result<Provisioned> {
        let resources = ResourceGuard::new(Arc::clone(&self.runtime), self.run_id);
        let mut registry = RegistryBuilder::new();

        for planned in plan.services() {
            let outcome = match &planned.placement {
                Placement::Remote(remote) => {
                    info!(
                        target: "testbed.provisioner",
                        service = %planned.name(),
                        "Using remote endpoint, not provisioning"
                    );
                    registry.insert(
                        Endpoint::remote(&planned.descriptor, &remote.address, remote.credential.clone()),
                        &planned.descriptor.properties,
                    );
                    Ok(())
                }
                Placement::Provision => {
                    self.provision_one(planned, gate, &resources, &mut registry)
                        .await
                }
            };

            if let Err(e) = outcome {
                error!(
                    target: "testbed.provisioner",
                    service = %planned.name(),
                    error = %e,
                    "Provisioning failed, releasing started resources"
                );
                let report = resources.release().await.unwrap_or_default();
                debug!(
                    target: "testbed.provisioner",
                    stopped = report.stopped,
                    failures = report.failures.len(),
                    "Rollback finished"
                );
                return Err(e);
            }
        }

        let containers = resources.container_count().await;
        info!(
            target: "testbed.provisioner",
            services = registry.len(),
            containers = containers,
            "All services ready"
        );

        Ok(Provisioned {
            resources,
            registry: registry.freeze(),
        })
    }

    async fn provision_one(
        &self,
        planned: &PlannedService,
        gate: &dyn ServiceGate,
        resources: &ResourceGuard,
        registry: &mut RegistryBuilder,
    ) -> Result<()> {
        let service = planned.name();
        if self.cancel.is_cancelled() {
            return Err(TestbedError::Cancelled(service.to_string()));
        }

        let network = self.ensure_network(service, resources).await?;
        let spec = ContainerSpec::for_service(&planned.descriptor, &network, self.run_id);

        self.cancellable(service, self.runtime.ensure_image(&spec.image))
            .await?;

        info!(
            target: "testbed.provisioner",
            service = %service,
            image = %spec.image,
            "Starting container"
        );
        let container_id = self.runtime.start_container(&spec).await.map_err(|e| {
            let logs = e.logs().map(str::to_string);
            TestbedError::provision(service, e, logs)
        })?;

        let mut handle = ContainerHandle::started(service, container_id, self.runtime.host());
        resources.record_container(handle.clone()).await;

        match self.bring_up(planned, &mut handle, gate).await {
            Ok(()) => {
                resources.record_ports(&handle).await;
                registry.insert(
                    Endpoint::provisioned(
                        &planned.descriptor,
                        &handle.container_id,
                        &handle.host,
                        handle.ports.clone(),
                    ),
                    &planned.descriptor.properties,
                );
                Ok(())
            }
            Err(e) => Err(self.attach_logs(e, &handle.container_id).await),
        }
    }

    async fn ensure_network(&self, service: &str, resources: &ResourceGuard) -> Result<String> {
        if let Some(name) = resources.network_name().await {
            return Ok(name);
        }

        let name = self.network_name();
        let labels = BTreeMap::from([(RUN_LABEL.to_string(), self.run_id.to_string())]);
        let id = self
            .runtime
            .create_network(&name, &labels)
            .await
            .map_err(|e| {
                TestbedError::provision(service, format!("failed to create network {name}: {e}"), None)
            })?;

        debug!(target: "testbed.provisioner", network = %name, "Network created");
        resources
            .record_network(NetworkHandle {
                id,
                name: name.clone(),
            })
            .await;
        Ok(name)
    }

    /// Run an engine step that may take minutes, aborting once `cancel` fires.
    async fn cancellable<T>(
        &self,
        service: &str,
        step: impl Future<Output = std::result::Result<T, RuntimeError>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TestbedError::Cancelled(service.to_string())),
            result = step => result.map_err(|e| TestbedError::provision(service, e, None)),
        }
    }

    async fn bring_up(
        &self,
        planned: &PlannedService,
        handle: &mut ContainerHandle,
        gate: &dyn ServiceGate,
    ) -> Result<()> {
        let descriptor = &planned.descriptor;
        let service = planned.name();

        self.cancellable(
            service,
            self.runtime
                .wait_running(&handle.container_id, descriptor.startup_timeout),
        )
        .await?;

        for port in &descriptor.exposed_ports {
            let host_port = self
                .runtime
                .mapped_port(&handle.container_id, port.container)
                .await
                .map_err(|e| TestbedError::provision(service, e, None))?;
            handle.ports.insert(port.container, host_port);
        }

        debug!(
            target: "testbed.provisioner",
            service = %service,
            ports = ?handle.ports,
            "Container running"
        );

        gate.ready(planned, handle, self.runtime.as_ref()).await
    }

    /// Fill in the container log tail on errors that carry one.
    async fn attach_logs(&self, error: TestbedError, container_id: &str) -> TestbedError {
        match error {
            TestbedError::Provision {
                service,
                reason,
                logs: None,
            } => {
                let logs = self.capture_logs(&service, container_id).await;
                TestbedError::provision(&service, reason, logs)
            }
            TestbedError::ReadinessTimeout {
                service,
                attempts,
                last_error,
                logs: None,
            } => {
                let logs = self
                    .capture_logs(&service, container_id)
                    .await
                    .map(|l| crate::errors::log_tail(&l, LOG_TAIL_LINES));
                TestbedError::ReadinessTimeout {
                    service,
                    attempts,
                    last_error,
                    logs,
                }
            }
            other => other,
        }
    }

    async fn capture_logs(&self, service: &str, container_id: &str) -> Option<String> {
        match self.runtime.logs(container_id).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(
                    target: "testbed.provisioner",
                    service = %service,
                    error = %e,
                    "Could not capture container logs"
                );
                None
            }
        }
    }
}
