//! Readiness probing.
//!
//! [`ReadinessProber::await_ready`] is a bounded loop: at most
//! `max_retries` attempts with a fixed interval between them, so at most
//! `max_retries - 1` sleeps. Each attempt runs under its own short timeout.
//! The interval sleep and the attempt both race a [`CancellationToken`] so a
//! run can be aborted without waiting out the retry budget.
//!
//! How a single attempt is executed is behind [`ProbeRunner`];
//! [`NetworkProbeRunner`] is the real implementation.

use crate::descriptor::ReadinessProbe;
use crate::runtime::{ContainerRuntime, RuntimeError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default per-attempt timeout, kept well under the retry interval.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a single probe attempt failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("probe attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("HTTP request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("describe command exited with code {exit_code}")]
    DescribeFailed { exit_code: i64 },

    #[error("describe command reported no active nodes")]
    NoActiveNodes,

    #[error("service has no container to run the describe command in")]
    NoContainer,

    #[error("probe port is not mapped to the host")]
    NoMappedPort,

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// What a probe attempt runs against.
pub struct ProbeTarget<'a> {
    pub service: &'a str,
    pub host: &'a str,
    /// Host port mapped to the probe's container port.
    pub port: Option<u16>,
    pub container_id: Option<&'a str>,
    pub runtime: &'a dyn ContainerRuntime,
}

impl ProbeTarget<'_> {
    fn address(&self) -> Result<String, ProbeError> {
        let port = self.port.ok_or(ProbeError::NoMappedPort)?;
        Ok(format!("{}:{port}", self.host))
    }
}

/// Executes one probe attempt.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn attempt(
        &self,
        probe: &ReadinessProbe,
        target: &ProbeTarget<'_>,
        timeout: Duration,
    ) -> Result<(), ProbeError>;
}

/// Probe runner that opens real sockets, sends real HTTP requests and runs
/// describe commands through the container runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProbeRunner;

#[async_trait]
impl ProbeRunner for NetworkProbeRunner {
    async fn attempt(
        &self,
        probe: &ReadinessProbe,
        target: &ProbeTarget<'_>,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        match probe {
            ReadinessProbe::TcpConnect { .. } => {
                let address = target.address()?;
                TcpStream::connect(address.as_str())
                    .await
                    .map(drop)
                    .map_err(|e| ProbeError::Connect {
                        address,
                        reason: e.to_string(),
                    })
            }
            ReadinessProbe::HttpGet { path, .. } => {
                let url = format!("{}://{}{path}", probe.scheme(), target.address()?);
                // Emulators serve self-signed certificates.
                let client = reqwest::Client::builder()
                    .timeout(timeout)
                    .danger_accept_invalid_certs(true)
                    .build()
                    .map_err(|e| ProbeError::Http {
                        url: url.clone(),
                        reason: e.to_string(),
                    })?;

                // Any response means the server is accepting requests.
                client
                    .get(&url)
                    .send()
                    .await
                    .map(drop)
                    .map_err(|e| ProbeError::Http {
                        url,
                        reason: e.to_string(),
                    })
            }
            ReadinessProbe::Describe {
                command, marker, ..
            } => {
                let container_id = target.container_id.ok_or(ProbeError::NoContainer)?;
                let output = target.runtime.exec(container_id, command).await?;
                if !output.success() {
                    return Err(ProbeError::DescribeFailed {
                        exit_code: output.exit_code,
                    });
                }
                if marker.count_nodes(&output.output) == 0 {
                    return Err(ProbeError::NoActiveNodes);
                }
                Ok(())
            }
        }
    }
}

/// Outcome of [`ReadinessProber::await_ready`].
#[derive(Debug)]
pub enum Readiness {
    Ready { attempts: u32 },
    TimedOut { attempts: u32, last_error: ProbeError },
    Cancelled { attempts: u32 },
}

/// Bounded-retry readiness gate.
#[derive(Clone)]
pub struct ReadinessProber {
    runner: Arc<dyn ProbeRunner>,
    attempt_timeout: Duration,
    cancel: CancellationToken,
}

impl ReadinessProber {
    pub fn new(
        runner: Arc<dyn ProbeRunner>,
        attempt_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            attempt_timeout,
            cancel,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Poll `probe` until it succeeds, `max_retries` attempts are used up,
    /// or the run is cancelled.
    #[instrument(skip_all, name = "testbed.prober.await_ready", fields(service = %target.service, probe = probe.kind()))]
    pub async fn await_ready(
        &self,
        probe: &ReadinessProbe,
        target: &ProbeTarget<'_>,
        max_retries: u32,
        interval: Duration,
    ) -> Readiness {
        let mut last_error = ProbeError::AttemptTimeout(Duration::ZERO);

        for attempt in 1..=max_retries {
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Readiness::Cancelled { attempts: attempt - 1 };
                }
                outcome = tokio::time::timeout(
                    self.attempt_timeout,
                    self.runner.attempt(probe, target, self.attempt_timeout),
                ) => outcome,
            };

            match outcome {
                Ok(Ok(())) => {
                    info!(
                        target: "testbed.prober",
                        service = %target.service,
                        attempts = attempt,
                        "Service is ready"
                    );
                    return Readiness::Ready { attempts: attempt };
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = ProbeError::AttemptTimeout(self.attempt_timeout),
            }

            debug!(
                target: "testbed.prober",
                service = %target.service,
                attempt,
                max_retries,
                error = %last_error,
                "Readiness probe failed"
            );

            if attempt < max_retries {
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => {
                        return Readiness::Cancelled { attempts: attempt };
                    }
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }

        warn!(
            target: "testbed.prober",
            service = %target.service,
            attempts = max_retries,
            error = %last_error,
            "Service did not become ready"
        );
        Readiness::TimedOut {
            attempts: max_retries,
            last_error,
        }
    }
}
