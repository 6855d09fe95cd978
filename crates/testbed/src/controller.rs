//! Lifecycle controller.
//!
//! A [`Testbed`] is built once per run and consumed by [`Testbed::setup`],
//! so Setup cannot run twice. Setup plans the run, provisions every
//! selected service behind a readiness gate and freezes the endpoint
//! registry. The returned [`RunningTestbed`] owns the run's resources until
//! [`RunningTestbed::teardown`] releases them; teardown is idempotent.
//!
//! [`Testbed::run`] wraps the whole lifecycle around an async test body and
//! guarantees teardown on success, panic and Ctrl-C.

use crate::catalog;
use crate::config::TestbedConfig;
use crate::descriptor::ServiceDescriptor;
use crate::errors::{Result, TestbedError};
use crate::plan::{PlannedService, RunPlan};
use crate::prober::{NetworkProbeRunner, ProbeRunner, ProbeTarget, Readiness, ReadinessProber};
use crate::provisioner::{ContainerHandle, Provisioner, ResourceGuard, ServiceGate, TeardownReport};
use crate::registry::{EndpointRegistry, PropertySink};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use common::types::RunId;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Readiness gate backed by the service's own probe.
struct ProbeGate {
    prober: ReadinessProber,
}

#[async_trait]
impl ServiceGate for ProbeGate {
    async fn ready(
        &self,
        planned: &PlannedService,
        container: &ContainerHandle,
        runtime: &dyn ContainerRuntime,
    ) -> Result<()> {
        let descriptor = &planned.descriptor;
        let probe = &descriptor.readiness_probe;
        let target = ProbeTarget {
            service: &container.service,
            host: &container.host,
            port: container.ports.get(&probe.port()).copied(),
            container_id: Some(&container.container_id),
            runtime,
        };

        match self
            .prober
            .await_ready(
                probe,
                &target,
                descriptor.readiness_max_retries,
                descriptor.readiness_retry_interval,
            )
            .await
        {
            Readiness::Ready { .. } => Ok(()),
            Readiness::TimedOut {
                attempts,
                last_error,
            } => Err(TestbedError::ReadinessTimeout {
                service: container.service.clone(),
                attempts,
                last_error: last_error.to_string(),
                logs: None,
            }),
            Readiness::Cancelled { .. } => Err(TestbedError::Cancelled(container.service.clone())),
        }
    }
}

/// Builder for [`Testbed`].
pub struct TestbedBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    config: Option<TestbedConfig>,
    services: Option<Vec<ServiceDescriptor>>,
    probes: Arc<dyn ProbeRunner>,
    env: Option<HashMap<String, String>>,
    cancel: CancellationToken,
    ctrl_c: bool,
}

impl TestbedBuilder {
    /// Use `config` instead of reading it from the environment.
    #[must_use]
    pub fn config(mut self, config: TestbedConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Declare the services of the run (default: the built-in catalog).
    #[must_use]
    pub fn services(mut self, services: Vec<ServiceDescriptor>) -> Self {
        self.services = Some(services);
        self
    }

    #[must_use]
    pub fn probe_runner(mut self, probes: Arc<dyn ProbeRunner>) -> Self {
        self.probes = probes;
        self
    }

    /// Environment snapshot used for remote overrides (default: the process
    /// environment at build time).
    #[must_use]
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Token that aborts readiness waits and interrupts [`Testbed::run`].
    #[must_use]
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether [`Testbed::run`] listens for Ctrl-C (default: yes).
    #[must_use]
    pub fn handle_ctrl_c(mut self, enabled: bool) -> Self {
        self.ctrl_c = enabled;
        self
    }

    /// Resolve configuration and the declared services.
    pub fn build(self) -> Result<Testbed> {
        let config = match self.config {
            Some(config) => config,
            None => TestbedConfig::from_env()?,
        };

        let mut declared = match self.services {
            Some(services) => services,
            None => catalog::builtin()?,
        };
        if let Some(path) = &config.services_file {
            let extra = catalog::load_services_file(path)?;
            debug!(
                target: "testbed.controller",
                path = %path.display(),
                services = extra.len(),
                "Loaded services file"
            );
            declared.extend(extra);
        }
        for descriptor in &mut declared {
            config.apply(descriptor);
        }

        Ok(Testbed {
            run_id: RunId::new(),
            config,
            declared,
            runtime: self.runtime,
            probes: self.probes,
            env: self.env.unwrap_or_else(|| std::env::vars().collect()),
            cancel: self.cancel,
            ctrl_c: self.ctrl_c,
        })
    }
}

/// One test run's environment, before Setup.
pub struct Testbed {
    run_id: RunId,
    config: TestbedConfig,
    declared: Vec<ServiceDescriptor>,
    runtime: Arc<dyn ContainerRuntime>,
    probes: Arc<dyn ProbeRunner>,
    env: HashMap<String, String>,
    cancel: CancellationToken,
    ctrl_c: bool,
}

impl Testbed {
    pub fn builder(runtime: Arc<dyn ContainerRuntime>) -> TestbedBuilder {
        TestbedBuilder {
            runtime,
            config: None,
            services: None,
            probes: Arc::new(NetworkProbeRunner),
            env: None,
            cancel: CancellationToken::new(),
            ctrl_c: true,
        }
    }

    /// Builder backed by the local Docker daemon.
    #[cfg(feature = "docker")]
    pub async fn docker() -> Result<TestbedBuilder> {
        let runtime = crate::docker::DockerRuntime::connect().await?;
        Ok(Self::builder(Arc::new(runtime)))
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    pub fn declared(&self) -> &[ServiceDescriptor] {
        &self.declared
    }

    /// Plan, provision and gate every selected service.
    ///
    /// On failure everything started so far has already been released when
    /// the error is returned.
    #[instrument(skip_all, name = "testbed.controller.setup", fields(run_id = %self.run_id))]
    pub async fn setup(self) -> Result<RunningTestbed> {
        let plan = RunPlan::build(&self.declared, &self.config.selection, &self.env)?;
        info!(
            target: "testbed.controller",
            services = ?plan.names(),
            "Setting up testbed"
        );

        let gate = ProbeGate {
            prober: ReadinessProber::new(
                Arc::clone(&self.probes),
                self.config.probe_timeout,
                self.cancel.clone(),
            ),
        };
        let provisioner = Provisioner::new(
            Arc::clone(&self.runtime),
            self.run_id,
            &self.config.network_prefix,
        )
        .with_cancellation(self.cancel.clone());

        let provisioned = provisioner.provision(&plan, &gate).await.map_err(|e| {
            error!(target: "testbed.controller", error = %e, "Setup failed");
            e
        })?;

        info!(
            target: "testbed.controller",
            endpoints = provisioned.registry.len(),
            "Testbed ready"
        );

        Ok(RunningTestbed {
            run_id: self.run_id,
            registry: Arc::new(provisioned.registry),
            resources: provisioned.resources,
        })
    }

    /// Setup, run `body` against the registry, then tear down.
    ///
    /// Teardown runs whether the body returns, panics (the panic is resumed
    /// afterwards) or the run is interrupted by Ctrl-C or the cancellation
    /// token, in which case [`TestbedError::Interrupted`] is returned.
    ///
    /// Listening for Ctrl-C installs tokio's SIGINT handler, which replaces
    /// the default terminate-on-SIGINT behavior for the rest of the process
    /// even after `run` returns. Disable it with
    /// [`TestbedBuilder::handle_ctrl_c`] when the process must stay killable.
    pub async fn run<F, Fut, T>(self, body: F) -> Result<T>
    where
        F: FnOnce(Arc<EndpointRegistry>) -> Fut,
        Fut: Future<Output = T>,
    {
        let cancel = self.cancel.clone();
        let stop_watcher = CancellationToken::new();
        let _watcher_guard = stop_watcher.clone().drop_guard();

        if self.ctrl_c {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = stop_watcher.cancelled() => {}
                    signal = tokio::signal::ctrl_c() => {
                        if signal.is_ok() {
                            warn!(target: "testbed.controller", "Interrupt received, tearing down");
                            cancel.cancel();
                        }
                    }
                }
            });
        }

        Self::run_to_completion(self, body, &cancel).await
    }

    async fn run_to_completion<F, Fut, T>(
        testbed: Self,
        body: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        F: FnOnce(Arc<EndpointRegistry>) -> Fut,
        Fut: Future<Output = T>,
    {
        let running = match testbed.setup().await {
            Ok(running) => running,
            Err(TestbedError::Cancelled(_)) if cancel.is_cancelled() => {
                return Err(TestbedError::Interrupted)
            }
            Err(e) => return Err(e),
        };

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            outcome = AssertUnwindSafe(body(running.registry())).catch_unwind() => Some(outcome),
        };

        running.teardown().await;

        match outcome {
            None => Err(TestbedError::Interrupted),
            Some(Ok(value)) => Ok(value),
            Some(Err(panic)) => std::panic::resume_unwind(panic),
        }
    }
}

/// A set-up run. Owns its containers and network until torn down.
///
/// Dropping it without [`RunningTestbed::teardown`] schedules the release on
/// the current tokio runtime.
pub struct RunningTestbed {
    run_id: RunId,
    registry: Arc<EndpointRegistry>,
    resources: ResourceGuard,
}

impl RunningTestbed {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Read-only endpoint registry, shared.
    pub fn registry(&self) -> Arc<EndpointRegistry> {
        Arc::clone(&self.registry)
    }

    /// Application properties rendered from every enabled service.
    pub fn properties(&self) -> BTreeMap<String, String> {
        self.registry.properties()
    }

    /// One-shot push of every property into `sink`.
    pub fn inject_into<S: PropertySink + ?Sized>(&self, sink: &mut S) {
        self.registry.inject_into(sink);
    }

    /// Stop every container in reverse start order and remove the network.
    ///
    /// Only the first call does any work; later calls return an empty report.
    #[instrument(skip_all, name = "testbed.controller.teardown", fields(run_id = %self.run_id))]
    pub async fn teardown(&self) -> TeardownReport {
        let Some(report) = self.resources.release().await else {
            debug!(target: "testbed.controller", "Already torn down");
            return TeardownReport::default();
        };

        if report.is_clean() {
            info!(
                target: "testbed.controller",
                stopped = report.stopped,
                "Testbed torn down"
            );
        } else {
            warn!(
                target: "testbed.controller",
                stopped = report.stopped,
                failures = report.failures.len(),
                "Testbed torn down with failures"
            );
        }
        report
    }

    pub async fn is_torn_down(&self) -> bool {
        self.resources.is_released().await
    }
}
