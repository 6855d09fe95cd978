//! Testbed error types.
//!
//! `ConfigError`, `TestbedError::Provision` and `TestbedError::ReadinessTimeout`
//! abort Setup. `TeardownError` is only ever logged: teardown keeps going
//! for the remaining resources regardless of individual failures.

use crate::runtime::RuntimeError;
use common::config::SettingError;
use thiserror::Error;

/// Number of container log lines carried by provisioning/readiness errors.
pub const LOG_TAIL_LINES: usize = 50;

/// Result type alias using `TestbedError`.
pub type Result<T> = std::result::Result<T, TestbedError>;

/// Malformed service graph or settings. Always detected before any
/// container starts and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },

    #[error("Service '{service}' readiness probe targets port {port}, which is not exposed")]
    ProbePortNotExposed { service: String, port: u16 },

    #[error("Unknown service selected: {0}")]
    UnknownService(String),

    #[error("Invalid descriptor for '{service}': {message}")]
    InvalidDescriptor { service: String, message: String },

    #[error("Invalid setting: {0}")]
    InvalidSetting(#[from] SettingError),

    #[error("Invalid services file {path}: {message}")]
    ServicesFile { path: String, message: String },
}

/// Errors surfaced by the lifecycle controller.
///
/// Every variant that concerns a single service names it, so a failed run
/// says which dependency broke before any test result is reported.
#[derive(Debug, Error)]
pub enum TestbedError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to provision '{service}': {reason}{}", log_suffix(.logs))]
    Provision {
        service: String,
        reason: String,
        logs: Option<String>,
    },

    #[error(
        "Service '{service}' not ready after {attempts} attempts: {last_error}{}",
        log_suffix(.logs)
    )]
    ReadinessTimeout {
        service: String,
        attempts: u32,
        last_error: String,
        logs: Option<String>,
    },

    #[error("Service '{0}' is not enabled in this run")]
    NotFound(String),

    #[error("Run cancelled while waiting for '{0}'")]
    Cancelled(String),

    #[error("Run interrupted by signal")]
    Interrupted,

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl TestbedError {
    /// Name of the service the error concerns, if any.
    pub fn service(&self) -> Option<&str> {
        match self {
            TestbedError::Provision { service, .. }
            | TestbedError::ReadinessTimeout { service, .. }
            | TestbedError::Cancelled(service)
            | TestbedError::NotFound(service) => Some(service),
            TestbedError::Config(_) | TestbedError::Interrupted | TestbedError::Runtime(_) => None,
        }
    }

    /// Captured container log tail, if the failure produced one.
    pub fn logs(&self) -> Option<&str> {
        match self {
            TestbedError::Provision { logs, .. } | TestbedError::ReadinessTimeout { logs, .. } => {
                logs.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn provision(service: &str, reason: impl ToString, logs: Option<String>) -> Self {
        TestbedError::Provision {
            service: service.to_string(),
            reason: reason.to_string(),
            logs: logs.map(|l| log_tail(&l, LOG_TAIL_LINES)),
        }
    }
}

/// Failures while releasing resources. Logged, never escalated.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("Failed to stop container {container_id} for '{service}': {source}")]
    StopContainer {
        service: String,
        container_id: String,
        #[source]
        source: RuntimeError,
    },

    #[error("Failed to remove network {network}: {source}")]
    RemoveNetwork {
        network: String,
        #[source]
        source: RuntimeError,
    },
}

/// Keep the last `lines` lines of a container log.
pub fn log_tail(logs: &str, lines: usize) -> String {
    let all: Vec<&str> = logs.lines().collect();
    let skip = all.len().saturating_sub(lines);
    all.into_iter().skip(skip).collect::<Vec<_>>().join("\n")
}

fn log_suffix(logs: &Option<String>) -> String {
    match logs {
        Some(logs) if !logs.trim().is_empty() => format!("\n--- container log tail ---\n{logs}"),
        _ => String::new(),
    }
}
