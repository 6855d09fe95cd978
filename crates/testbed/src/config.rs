//! Testbed configuration.
//!
//! Configuration is loaded from environment variables. Readiness settings
//! are optional overrides: when unset, every descriptor keeps its own
//! bounds.

use crate::descriptor::ServiceDescriptor;
use crate::errors::ConfigError;
use crate::plan::Selection;
use crate::prober::DEFAULT_ATTEMPT_TIMEOUT;
use common::config::{list, non_empty, optional_positive, positive, SettingError};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default prefix of the per-run network name.
pub const DEFAULT_NETWORK_PREFIX: &str = "testbed";

pub const ENV_SERVICES: &str = "TESTBED_SERVICES";
pub const ENV_MODE: &str = "TESTBED_MODE";
pub const ENV_READINESS_MAX_RETRIES: &str = "TESTBED_READINESS_MAX_RETRIES";
pub const ENV_READINESS_INTERVAL_MS: &str = "TESTBED_READINESS_INTERVAL_MS";
pub const ENV_PROBE_TIMEOUT_MS: &str = "TESTBED_PROBE_TIMEOUT_MS";
pub const ENV_STARTUP_TIMEOUT_SECS: &str = "TESTBED_STARTUP_TIMEOUT_SECS";
pub const ENV_NETWORK_PREFIX: &str = "TESTBED_NETWORK_PREFIX";
pub const ENV_SERVICES_FILE: &str = "TESTBED_SERVICES_FILE";

/// Testbed configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestbedConfig {
    /// Which declared services the run enables.
    pub selection: Selection,

    /// Overrides every descriptor's `readiness_max_retries`.
    pub readiness_max_retries: Option<u32>,

    /// Overrides every descriptor's `readiness_retry_interval`.
    pub readiness_retry_interval: Option<Duration>,

    /// Timeout of a single probe attempt (default: 1s).
    pub probe_timeout: Duration,

    /// Overrides every descriptor's `startup_timeout`.
    pub startup_timeout: Option<Duration>,

    /// Prefix of the run network name (default: "testbed").
    pub network_prefix: String,

    /// JSON file with extra service descriptors.
    pub services_file: Option<PathBuf>,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            selection: Selection::Static,
            readiness_max_retries: None,
            readiness_retry_interval: None,
            probe_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            startup_timeout: None,
            network_prefix: DEFAULT_NETWORK_PREFIX.to_string(),
            services_file: None,
        }
    }
}

impl TestbedConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from a variable map (testable without touching the
    /// process environment).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let services = list(vars, ENV_SERVICES);

        let selection = match non_empty(vars, ENV_MODE) {
            None if services.is_some() => Selection::opt_in(services.unwrap_or_default()),
            None => Selection::Static,
            Some(mode) if mode.eq_ignore_ascii_case("static") => Selection::Static,
            Some(mode) if mode.eq_ignore_ascii_case("opt-in") || mode.eq_ignore_ascii_case("opt_in") => {
                Selection::opt_in(services.unwrap_or_default())
            }
            Some(other) => {
                return Err(SettingError::UnknownVariant {
                    key: ENV_MODE.to_string(),
                    value: other.to_string(),
                    expected: "static, opt-in".to_string(),
                }
                .into())
            }
        };

        let readiness_max_retries = optional_positive::<u32>(vars, ENV_READINESS_MAX_RETRIES)?;
        let readiness_retry_interval =
            optional_positive::<u64>(vars, ENV_READINESS_INTERVAL_MS)?.map(Duration::from_millis);
        let probe_timeout = Duration::from_millis(positive::<u64>(
            vars,
            ENV_PROBE_TIMEOUT_MS,
            duration_millis(DEFAULT_ATTEMPT_TIMEOUT),
        )?);
        let startup_timeout =
            optional_positive::<u64>(vars, ENV_STARTUP_TIMEOUT_SECS)?.map(Duration::from_secs);

        let network_prefix = non_empty(vars, ENV_NETWORK_PREFIX)
            .unwrap_or(DEFAULT_NETWORK_PREFIX)
            .to_string();
        let services_file = non_empty(vars, ENV_SERVICES_FILE).map(PathBuf::from);

        Ok(Self {
            selection,
            readiness_max_retries,
            readiness_retry_interval,
            probe_timeout,
            startup_timeout,
            network_prefix,
            services_file,
        })
    }

    /// Apply the configured overrides to a descriptor.
    pub fn apply(&self, descriptor: &mut ServiceDescriptor) {
        if let Some(retries) = self.readiness_max_retries {
            descriptor.readiness_max_retries = retries;
        }
        if let Some(interval) = self.readiness_retry_interval {
            descriptor.readiness_retry_interval = interval;
        }
        if let Some(timeout) = self.startup_timeout {
            descriptor.startup_timeout = timeout;
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
