//! Docker daemon connection helpers for env-tests.

use std::sync::Arc;
use std::time::Duration;
use testbed::config::TestbedConfig;
use testbed::docker::DockerRuntime;
use testbed::plan::Selection;
use testbed::runtime::RuntimeError;
use testbed::TestbedBuilder;
use testbed::Testbed;
use thiserror::Error;

/// Readiness attempts for real services; image pulls are not counted here.
pub const ENV_READINESS_MAX_RETRIES: u32 = 90;

/// Network prefix for env-test runs, so leftovers are easy to spot.
pub const ENV_NETWORK_PREFIX: &str = "testbed-env";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Docker daemon not reachable. Start Docker or set DOCKER_HOST: {0}")]
    NotReachable(#[from] RuntimeError),
}

/// Connected daemon shared by a test.
pub struct DockerDaemon {
    runtime: Arc<DockerRuntime>,
}

impl DockerDaemon {
    pub async fn connect() -> Result<Self, DaemonError> {
        let runtime = DockerRuntime::connect().await?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    pub fn runtime(&self) -> Arc<DockerRuntime> {
        Arc::clone(&self.runtime)
    }

    /// Builder over the built-in catalog enabling only `services`.
    pub fn testbed(&self, services: &[&str]) -> TestbedBuilder {
        Testbed::builder(self.runtime())
            .config(env_config(services))
            .env(std::collections::HashMap::new())
    }
}

/// Opt-in configuration with a budget generous enough for cold JVM starts.
pub fn env_config(services: &[&str]) -> TestbedConfig {
    TestbedConfig {
        selection: Selection::opt_in(services.iter().copied()),
        readiness_max_retries: Some(ENV_READINESS_MAX_RETRIES),
        readiness_retry_interval: Some(Duration::from_secs(2)),
        network_prefix: ENV_NETWORK_PREFIX.to_string(),
        ..TestbedConfig::default()
    }
}
