//! Service descriptors.
//!
//! A [`ServiceDescriptor`] is the declarative definition of one backing
//! service: what image to run, how it is addressed on the shared network,
//! how to tell it is ready, and which application properties its endpoint
//! feeds. Descriptors are pure data; graph-level checks (unknown
//! dependencies, cycles, duplicate names) happen when a
//! [`RunPlan`](crate::plan::RunPlan) is built.

use crate::errors::ConfigError;
use common::config::{env_key, non_empty};
use common::secret::SecretString;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

/// Default time for a container process to report running.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of readiness attempts.
pub const DEFAULT_READINESS_MAX_RETRIES: u32 = 50;

/// Default fixed interval between readiness attempts.
pub const DEFAULT_READINESS_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Placeholders accepted in property templates besides `{port:<n>}`.
const PLACEHOLDERS: [&str; 5] = ["host", "port", "address", "url", "credential"];

/// A container port to publish, optionally pinned to a fixed host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortSpec {
    pub container: u16,
    #[serde(default)]
    pub host: Option<u16>,
}

impl PortSpec {
    /// Publish on a random host port.
    pub fn dynamic(container: u16) -> Self {
        Self {
            container,
            host: None,
        }
    }

    /// Publish on a fixed host port.
    pub fn fixed(container: u16, host: u16) -> Self {
        Self {
            container,
            host: Some(host),
        }
    }
}

/// How a describe command's output identifies an active node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum NodeMarker {
    /// A line starting with the prefix is one active node (`nodetool status` → `UN `).
    LinePrefix(String),
    /// A line containing the text is one active node.
    Contains(String),
}

impl NodeMarker {
    /// Count active nodes in command output.
    pub fn count_nodes(&self, output: &str) -> usize {
        output
            .lines()
            .filter(|line| match self {
                NodeMarker::LinePrefix(prefix) => line.trim_start().starts_with(prefix.as_str()),
                NodeMarker::Contains(text) => line.contains(text.as_str()),
            })
            .count()
    }
}

/// Application-level readiness check for a started service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// Open and immediately close a TCP connection to the mapped port.
    TcpConnect { port: u16 },

    /// Run the service's own cluster-describe tool inside the container;
    /// ready once it exits cleanly and reports at least one active node.
    Describe {
        port: u16,
        command: Vec<String>,
        marker: NodeMarker,
    },

    /// GET a fixed path; any HTTP response counts, status is not checked.
    HttpGet {
        port: u16,
        path: String,
        #[serde(default)]
        tls: bool,
    },
}

impl ReadinessProbe {
    pub fn tcp(port: u16) -> Self {
        ReadinessProbe::TcpConnect { port }
    }

    pub fn http(port: u16, path: impl Into<String>) -> Self {
        ReadinessProbe::HttpGet {
            port,
            path: path.into(),
            tls: false,
        }
    }

    pub fn https(port: u16, path: impl Into<String>) -> Self {
        ReadinessProbe::HttpGet {
            port,
            path: path.into(),
            tls: true,
        }
    }

    pub fn describe<I, S>(port: u16, command: I, marker: NodeMarker) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReadinessProbe::Describe {
            port,
            command: command.into_iter().map(Into::into).collect(),
            marker,
        }
    }

    /// Container port the probe targets.
    pub fn port(&self) -> u16 {
        match self {
            ReadinessProbe::TcpConnect { port }
            | ReadinessProbe::Describe { port, .. }
            | ReadinessProbe::HttpGet { port, .. } => *port,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ReadinessProbe::TcpConnect { .. } => "tcp_connect",
            ReadinessProbe::Describe { .. } => "describe",
            ReadinessProbe::HttpGet { .. } => "http_get",
        }
    }

    /// URL scheme a client should use against the probed port.
    pub fn scheme(&self) -> &'static str {
        match self {
            ReadinessProbe::HttpGet { tls: true, .. } => "https",
            _ => "http",
        }
    }
}

/// One application property fed from the service's resolved endpoint.
///
/// Templates may reference `{host}`, `{port}`, `{port:<container port>}`,
/// `{address}`, `{url}` and `{credential}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PropertyBinding {
    pub key: String,
    pub template: String,
}

/// Environment variables that switch a service to a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteOverride {
    pub endpoint_var: String,
    pub credential_var: String,
}

impl RemoteOverride {
    /// `TESTBED_<NAME>_ENDPOINT` / `TESTBED_<NAME>_CREDENTIAL`.
    pub fn for_service(name: &str) -> Self {
        let key = env_key(name);
        Self {
            endpoint_var: format!("TESTBED_{key}_ENDPOINT"),
            credential_var: format!("TESTBED_{key}_CREDENTIAL"),
        }
    }

    /// Look the override up in an environment snapshot.
    ///
    /// Only the endpoint variable decides; the credential is optional.
    pub fn resolve(&self, env: &HashMap<String, String>) -> Option<RemoteEndpoint> {
        let address = non_empty(env, &self.endpoint_var)?.to_string();
        let credential = non_empty(env, &self.credential_var).map(SecretString::from);
        Some(RemoteEndpoint {
            address,
            credential,
        })
    }
}

/// Externally supplied endpoint for a service that is not provisioned.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    pub address: String,
    pub credential: Option<SecretString>,
}

/// Declarative definition of one backing service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub image: String,
    pub network_alias: String,
    pub environment: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub exposed_ports: Vec<PortSpec>,
    pub depends_on: Vec<String>,
    pub readiness_probe: ReadinessProbe,
    pub startup_timeout: Duration,
    pub readiness_max_retries: u32,
    pub readiness_retry_interval: Duration,
    pub properties: Vec<PropertyBinding>,
    pub remote: RemoteOverride,
    /// Well-known credential of the provisioned service (e.g. an emulator key).
    pub credential: Option<SecretString>,
}

impl ServiceDescriptor {
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::new(name.into(), image.into())
    }

    /// Container port the probe targets; also the service's primary port.
    pub fn primary_port(&self) -> u16 {
        self.readiness_probe.port()
    }

    pub fn exposes(&self, container_port: u16) -> bool {
        self.exposed_ports.iter().any(|p| p.container == container_port)
    }

    /// Check everything that can be checked on a descriptor in isolation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidDescriptor {
            service: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty".to_string()));
        }
        if self.network_alias.trim().is_empty() {
            return Err(invalid("network alias must not be empty".to_string()));
        }
        if self.readiness_max_retries == 0 {
            return Err(invalid("readiness_max_retries must be greater than 0".to_string()));
        }
        if self.startup_timeout.is_zero() {
            return Err(invalid("startup_timeout must be greater than 0".to_string()));
        }

        let mut seen = BTreeSet::new();
        for port in &self.exposed_ports {
            if !seen.insert(port.container) {
                return Err(invalid(format!("port {} exposed twice", port.container)));
            }
        }

        let probe_port = self.readiness_probe.port();
        if !self.exposes(probe_port) {
            return Err(ConfigError::ProbePortNotExposed {
                service: self.name.clone(),
                port: probe_port,
            });
        }

        if let ReadinessProbe::Describe { command, .. } = &self.readiness_probe {
            if command.is_empty() {
                return Err(invalid("describe probe command must not be empty".to_string()));
            }
        }

        for binding in &self.properties {
            self.validate_template(binding).map_err(invalid)?;
        }

        Ok(())
    }

    fn validate_template(&self, binding: &PropertyBinding) -> Result<(), String> {
        for placeholder in placeholders(&binding.template)? {
            if PLACEHOLDERS.contains(&placeholder) {
                continue;
            }
            let port = placeholder
                .strip_prefix("port:")
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| {
                    format!(
                        "property '{}' uses unknown placeholder {{{placeholder}}}",
                        binding.key
                    )
                })?;
            if !self.exposes(port) {
                return Err(format!(
                    "property '{}' references port {port}, which is not exposed",
                    binding.key
                ));
            }
        }
        Ok(())
    }
}

/// Extract `{...}` placeholder names from a template.
pub(crate) fn placeholders(template: &str) -> Result<Vec<&str>, String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = rest.get(start + 1..).unwrap_or_default();
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{template}'"))?;
        found.push(after.get(..end).unwrap_or_default());
        rest = after.get(end + 1..).unwrap_or_default();
    }
    Ok(found)
}

/// Builder for [`ServiceDescriptor`].
#[derive(Debug)]
pub struct ServiceDescriptorBuilder {
    name: String,
    image: String,
    network_alias: Option<String>,
    environment: BTreeMap<String, String>,
    command: Vec<String>,
    exposed_ports: Vec<PortSpec>,
    depends_on: Vec<String>,
    readiness_probe: Option<ReadinessProbe>,
    startup_timeout: Duration,
    readiness_max_retries: u32,
    readiness_retry_interval: Duration,
    properties: Vec<PropertyBinding>,
    remote: Option<RemoteOverride>,
    credential: Option<SecretString>,
}

impl ServiceDescriptorBuilder {
    fn new(name: String, image: String) -> Self {
        Self {
            name,
            image,
            network_alias: None,
            environment: BTreeMap::new(),
            command: Vec::new(),
            exposed_ports: Vec::new(),
            depends_on: Vec::new(),
            readiness_probe: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            readiness_max_retries: DEFAULT_READINESS_MAX_RETRIES,
            readiness_retry_interval: DEFAULT_READINESS_RETRY_INTERVAL,
            properties: Vec::new(),
            remote: None,
            credential: None,
        }
    }

    /// Network alias (defaults to the service name).
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.network_alias = Some(alias.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn expose(mut self, container_port: u16) -> Self {
        self.exposed_ports.push(PortSpec::dynamic(container_port));
        self
    }

    #[must_use]
    pub fn expose_fixed(mut self, container_port: u16, host_port: u16) -> Self {
        self.exposed_ports.push(PortSpec::fixed(container_port, host_port));
        self
    }

    #[must_use]
    pub fn depends_on(mut self, service: impl Into<String>) -> Self {
        let service = service.into();
        if !self.depends_on.contains(&service) {
            self.depends_on.push(service);
        }
        self
    }

    #[must_use]
    pub fn probe(mut self, probe: ReadinessProbe) -> Self {
        self.readiness_probe = Some(probe);
        self
    }

    #[must_use]
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn readiness(mut self, max_retries: u32, interval: Duration) -> Self {
        self.readiness_max_retries = max_retries;
        self.readiness_retry_interval = interval;
        self
    }

    #[must_use]
    pub fn property(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.properties.push(PropertyBinding {
            key: key.into(),
            template: template.into(),
        });
        self
    }

    /// Override the remote passthrough variable names.
    #[must_use]
    pub fn remote_vars(
        mut self,
        endpoint_var: impl Into<String>,
        credential_var: impl Into<String>,
    ) -> Self {
        self.remote = Some(RemoteOverride {
            endpoint_var: endpoint_var.into(),
            credential_var: credential_var.into(),
        });
        self
    }

    #[must_use]
    pub fn credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(SecretString::from(credential.into()));
        self
    }

    /// Build and validate the descriptor.
    pub fn build(self) -> Result<ServiceDescriptor, ConfigError> {
        let readiness_probe = self
            .readiness_probe
            .ok_or_else(|| ConfigError::InvalidDescriptor {
                service: self.name.clone(),
                message: "readiness probe is required".to_string(),
            })?;

        let descriptor = ServiceDescriptor {
            network_alias: self.network_alias.unwrap_or_else(|| self.name.clone()),
            remote: self
                .remote
                .unwrap_or_else(|| RemoteOverride::for_service(&self.name)),
            name: self.name,
            image: self.image,
            environment: self.environment,
            command: self.command,
            exposed_ports: self.exposed_ports,
            depends_on: self.depends_on,
            readiness_probe,
            startup_timeout: self.startup_timeout,
            readiness_max_retries: self.readiness_max_retries,
            readiness_retry_interval: self.readiness_retry_interval,
            properties: self.properties,
            credential: self.credential,
        };

        descriptor.validate()?;
        Ok(descriptor)
    }
}
