//! Endpoint registry and property injection.
//!
//! The registry maps service name to the endpoint resolved for this run. It
//! is filled through a [`RegistryBuilder`] while services become ready and
//! then frozen; test code only ever sees the read-only [`EndpointRegistry`].

use crate::descriptor::{PropertyBinding, ServiceDescriptor};
use crate::errors::TestbedError;
use chrono::{DateTime, Utc};
use common::secret::{ExposeSecret, SecretString};
use std::collections::{BTreeMap, HashMap};

/// Where an endpoint came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointOrigin {
    /// Started by this run.
    Provisioned { container_id: String },
    /// Supplied through remote override variables; nothing was started.
    Remote,
}

/// Connection coordinates of one service.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub service: String,
    pub host: String,
    /// Host port of the primary (probed) container port, if known.
    pub port: Option<u16>,
    /// Container port → host port, for provisioned services.
    pub ports: BTreeMap<u16, u16>,
    /// `host:port` for provisioned services, the supplied value verbatim for remote ones.
    pub address: String,
    pub url: String,
    pub credential: Option<SecretString>,
    pub origin: EndpointOrigin,
    pub resolved_at: DateTime<Utc>,
}

impl Endpoint {
    /// Endpoint of a container started by this run.
    pub fn provisioned(
        descriptor: &ServiceDescriptor,
        container_id: &str,
        host: &str,
        ports: BTreeMap<u16, u16>,
    ) -> Self {
        let port = ports.get(&descriptor.primary_port()).copied();
        let address = match port {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let url = format!("{}://{address}", descriptor.readiness_probe.scheme());

        Self {
            service: descriptor.name.clone(),
            host: host.to_string(),
            port,
            ports,
            address,
            url,
            credential: descriptor.credential.clone(),
            origin: EndpointOrigin::Provisioned {
                container_id: container_id.to_string(),
            },
            resolved_at: Utc::now(),
        }
    }

    /// Endpoint supplied from outside; `address` is kept verbatim.
    pub fn remote(
        descriptor: &ServiceDescriptor,
        address: &str,
        credential: Option<SecretString>,
    ) -> Self {
        let (host, port) = split_authority(address);
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("{}://{address}", descriptor.readiness_probe.scheme())
        };

        Self {
            service: descriptor.name.clone(),
            host,
            port,
            ports: BTreeMap::new(),
            address: address.to_string(),
            url,
            credential,
            origin: EndpointOrigin::Remote,
            resolved_at: Utc::now(),
        }
    }

    /// Host port published for a container port.
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }

    pub fn is_remote(&self) -> bool {
        self.origin == EndpointOrigin::Remote
    }

    /// Render a property template against this endpoint.
    ///
    /// Templates are validated with the descriptor, so unknown placeholders
    /// cannot occur here; they are rendered empty if they do.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest.get(start..).and_then(|tail| tail.find('}')) else {
                break;
            };
            rendered.push_str(rest.get(..start).unwrap_or_default());
            let name = rest.get(start + 1..start + len).unwrap_or_default();
            rendered.push_str(&self.placeholder_value(name));
            rest = rest.get(start + len + 1..).unwrap_or_default();
        }
        rendered.push_str(rest);
        rendered
    }

    fn placeholder_value(&self, name: &str) -> String {
        match name {
            "host" => self.host.clone(),
            "port" => self.port.map(|p| p.to_string()).unwrap_or_default(),
            "address" => self.address.clone(),
            "url" => self.url.clone(),
            "credential" => self
                .credential
                .as_ref()
                .map(|c| c.expose_secret().to_string())
                .unwrap_or_default(),
            other => other
                .strip_prefix("port:")
                .and_then(|p| p.parse::<u16>().ok())
                .and_then(|p| self.mapped_port(p).or(self.port))
                .map(|p| p.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Best-effort host/port split of a remote address (`scheme://host:port/path`).
fn split_authority(address: &str) -> (String, Option<u16>) {
    let without_scheme = address
        .split_once("://")
        .map_or(address, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);

    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (authority.to_string(), None),
        },
        None => (authority.to_string(), None),
    }
}

/// Destination for the one-shot property push.
pub trait PropertySink {
    fn set_property(&mut self, key: &str, value: String);
}

impl PropertySink for HashMap<String, String> {
    fn set_property(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl PropertySink for BTreeMap<String, String> {
    fn set_property(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// Read-only map of service name → resolved endpoint for one run.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    entries: BTreeMap<String, Endpoint>,
    bindings: BTreeMap<String, Vec<PropertyBinding>>,
}

impl EndpointRegistry {
    /// Endpoint of an enabled service.
    ///
    /// Asking for a service that was never enabled is a usage error and
    /// returns [`TestbedError::NotFound`].
    pub fn get(&self, service: &str) -> Result<&Endpoint, TestbedError> {
        self.entries
            .get(service)
            .ok_or_else(|| TestbedError::NotFound(service.to_string()))
    }

    pub fn contains(&self, service: &str) -> bool {
        self.entries.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.entries.values()
    }

    /// Application properties rendered from every enabled service.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        for (service, bindings) in &self.bindings {
            let Some(endpoint) = self.entries.get(service) else {
                continue;
            };
            for binding in bindings {
                properties.insert(binding.key.clone(), endpoint.render(&binding.template));
            }
        }
        properties
    }

    /// Push every rendered property into `sink`.
    pub fn inject_into<S: PropertySink + ?Sized>(&self, sink: &mut S) {
        for (key, value) in self.properties() {
            sink.set_property(&key, value);
        }
    }
}

/// Incrementally filled registry, frozen once Setup completes.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: EndpointRegistry,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a ready service.
    pub fn insert(&mut self, endpoint: Endpoint, bindings: &[PropertyBinding]) {
        let service = endpoint.service.clone();
        self.registry
            .bindings
            .insert(service.clone(), bindings.to_vec());
        self.registry.entries.insert(service, endpoint);
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn freeze(self) -> EndpointRegistry {
        self.registry
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::descriptor::ReadinessProbe;

    fn cosmos() -> ServiceDescriptor {
        ServiceDescriptor::builder("cosmos-nosql", "azure-cosmos-emulator")
            .expose(8081)
            .expose(10251)
            .probe(ReadinessProbe::https(8081, "/_explorer/emulator.pem"))
            .credential("master-key")
            .property("azure.cosmos.endpoint", "{url}/")
            .property("azure.cosmos.key", "{credential}")
            .property("azure.cosmos.direct-port", "{port:10251}")
            .build()
            .unwrap()
    }

    fn provisioned_cosmos() -> Endpoint {
        Endpoint::provisioned(
            &cosmos(),
            "c0ffee",
            "127.0.0.1",
            BTreeMap::from([(8081, 49153), (10251, 49154)]),
        )
    }

    #[test]
    fn test_provisioned_endpoint_coordinates() {
        let endpoint = provisioned_cosmos();

        assert_eq!(endpoint.port, Some(49153));
        assert_eq!(endpoint.address, "127.0.0.1:49153");
        assert_eq!(endpoint.url, "https://127.0.0.1:49153");
        assert_eq!(endpoint.mapped_port(10251), Some(49154));
        assert!(!endpoint.is_remote());
    }

    #[test]
    fn test_render_placeholders() {
        let endpoint = provisioned_cosmos();

        assert_eq!(endpoint.render("{host}:{port}"), "127.0.0.1:49153");
        assert_eq!(endpoint.render("{credential}"), "master-key");
        assert_eq!(endpoint.render("{port:10251}"), "49154");
        assert_eq!(endpoint.render("plain"), "plain");
    }

    #[test]
    fn test_remote_endpoint_is_verbatim() {
        let endpoint = Endpoint::remote(
            &cosmos(),
            "https://example.documents.azure.com:443/",
            Some(SecretString::from("remote-key")),
        );

        assert!(endpoint.is_remote());
        assert_eq!(endpoint.address, "https://example.documents.azure.com:443/");
        assert_eq!(endpoint.url, "https://example.documents.azure.com:443/");
        assert_eq!(endpoint.host, "example.documents.azure.com");
        assert_eq!(endpoint.port, Some(443));
        assert_eq!(endpoint.render("{credential}"), "remote-key");
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("broker:9092"), ("broker".to_string(), Some(9092)));
        assert_eq!(split_authority("db.internal"), ("db.internal".to_string(), None));
        assert_eq!(
            split_authority("http://mock:8080/base"),
            ("mock".to_string(), Some(8080))
        );
    }

    #[test]
    fn test_get_unknown_service_is_not_found() {
        let registry = RegistryBuilder::new().freeze();
        let err = registry.get("kafka").unwrap_err();
        assert!(matches!(err, TestbedError::NotFound(ref name) if name == "kafka"));
    }

    #[test]
    fn test_properties_and_injection() {
        let descriptor = cosmos();
        let mut builder = RegistryBuilder::new();
        builder.insert(provisioned_cosmos(), &descriptor.properties);
        let registry = builder.freeze();

        let properties = registry.properties();
        assert_eq!(
            properties.get("azure.cosmos.endpoint").map(String::as_str),
            Some("https://127.0.0.1:49153/")
        );
        assert_eq!(
            properties.get("azure.cosmos.key").map(String::as_str),
            Some("master-key")
        );

        let mut sink: HashMap<String, String> = HashMap::new();
        registry.inject_into(&mut sink);
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.get("azure.cosmos.direct-port").map(String::as_str), Some("49154"));
    }

    #[test]
    fn test_debug_redacts_credential() {
        let debug = format!("{:?}", provisioned_cosmos());
        assert!(!debug.contains("master-key"));
    }
}
