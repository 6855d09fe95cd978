//! Built-in service descriptors and the services file loader.
//!
//! Catalog entries are returned as builders so callers can add properties,
//! ports or environment before building. [`builtin`] builds all of them
//! with their default settings.

use crate::descriptor::{
    NodeMarker, PortSpec, PropertyBinding, ReadinessProbe, RemoteOverride, ServiceDescriptor,
    ServiceDescriptorBuilder,
};
use crate::errors::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub const ZOOKEEPER: &str = "zookeeper";
pub const KAFKA: &str = "kafka";
pub const CASSANDRA: &str = "cassandra";
pub const SCYLLA: &str = "scylla";
pub const COSMOS_NOSQL: &str = "cosmos-nosql";
pub const WIREMOCK: &str = "wiremock";

/// Host port of Kafka's host-facing listener. It is advertised to clients,
/// so it has to be fixed.
pub const KAFKA_HOST_PORT: u16 = 29092;

/// Well-known master key of the document-database emulator.
pub const COSMOS_EMULATOR_KEY: &str =
    "C2y6yDjf5/R+ob0N8A7Cgv30VRDJIWEHLM+4QDU5DE2nQ9nDuVTqobD4b8mGGyPMbIZnqyMsEcaGQy67XIw/Jw==";

pub fn zookeeper() -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(ZOOKEEPER, "confluentinc/cp-zookeeper:7.5.0")
        .env("ZOOKEEPER_CLIENT_PORT", "2181")
        .env("ZOOKEEPER_TICK_TIME", "2000")
        .expose(2181)
        .probe(ReadinessProbe::tcp(2181))
        .property("zookeeper.connect", "{address}")
}

/// Single broker. Containers on the run network reach it as `kafka:9092`,
/// the host through `localhost:29092`.
pub fn kafka() -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(KAFKA, "confluentinc/cp-kafka:7.5.0")
        .env("KAFKA_BROKER_ID", "1")
        .env("KAFKA_ZOOKEEPER_CONNECT", "zookeeper:2181")
        .env(
            "KAFKA_LISTENERS",
            "PLAINTEXT://0.0.0.0:9092,PLAINTEXT_HOST://0.0.0.0:29092",
        )
        .env(
            "KAFKA_ADVERTISED_LISTENERS",
            format!("PLAINTEXT://kafka:9092,PLAINTEXT_HOST://localhost:{KAFKA_HOST_PORT}"),
        )
        .env(
            "KAFKA_LISTENER_SECURITY_PROTOCOL_MAP",
            "PLAINTEXT:PLAINTEXT,PLAINTEXT_HOST:PLAINTEXT",
        )
        .env("KAFKA_INTER_BROKER_LISTENER_NAME", "PLAINTEXT")
        .env("KAFKA_OFFSETS_TOPIC_REPLICATION_FACTOR", "1")
        .env("KAFKA_TRANSACTION_STATE_LOG_REPLICATION_FACTOR", "1")
        .env("KAFKA_TRANSACTION_STATE_LOG_MIN_ISR", "1")
        .expose(9092)
        .expose_fixed(KAFKA_HOST_PORT, KAFKA_HOST_PORT)
        .depends_on(ZOOKEEPER)
        .probe(ReadinessProbe::describe(
            9092,
            [
                "kafka-broker-api-versions",
                "--bootstrap-server",
                "localhost:9092",
            ],
            NodeMarker::Contains("(id:".to_string()),
        ))
        .property("kafka.bootstrap-servers", "{host}:{port:29092}")
}

pub fn cassandra() -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(CASSANDRA, "cassandra:4.1")
        .env("MAX_HEAP_SIZE", "512M")
        .env("HEAP_NEWSIZE", "128M")
        .env("CASSANDRA_DC", "datacenter1")
        .expose(9042)
        .probe(cql_describe())
        .startup_timeout(Duration::from_secs(180))
        .property("cassandra.contact-points", "{address}")
        .property("cassandra.local-datacenter", "datacenter1")
}

/// Cassandra-compatible emulator, limited to one core so it fits CI runners.
pub fn scylla() -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(SCYLLA, "scylladb/scylla:5.2")
        .command(["--smp", "1", "--memory", "512M", "--overprovisioned", "1"])
        .expose(9042)
        .probe(cql_describe())
        .property("scylla.contact-points", "{address}")
        .property("scylla.local-datacenter", "datacenter1")
}

/// Document-database emulator over HTTPS with a self-signed certificate.
pub fn cosmos_nosql() -> ServiceDescriptorBuilder {
    let mut builder =
        ServiceDescriptor::builder(COSMOS_NOSQL, "mcr.microsoft.com/cosmosdb/linux/azure-cosmos-emulator:latest")
            .env("AZURE_COSMOS_EMULATOR_PARTITION_COUNT", "3")
            .env("AZURE_COSMOS_EMULATOR_ENABLE_DATA_PERSISTENCE", "false")
            .expose(8081);
    for port in 10250..=10255 {
        builder = builder.expose(port);
    }
    builder
        .probe(ReadinessProbe::https(8081, "/_explorer/emulator.pem"))
        .startup_timeout(Duration::from_secs(300))
        .credential(COSMOS_EMULATOR_KEY)
        .remote_vars("COSMOS_ENDPOINT", "COSMOS_KEY")
        .property("azure.cosmos.endpoint", "{url}/")
        .property("azure.cosmos.key", "{credential}")
}

pub fn wiremock() -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(WIREMOCK, "wiremock/wiremock:3.3.1")
        .command(["--disable-banner"])
        .expose(8080)
        .probe(ReadinessProbe::http(8080, "/__admin/health"))
        .property("wiremock.base-url", "{url}")
}

fn cql_describe() -> ReadinessProbe {
    ReadinessProbe::describe(
        9042,
        ["nodetool", "status"],
        NodeMarker::LinePrefix("UN".to_string()),
    )
}

/// Every catalog service with default settings, dependencies first.
pub fn builtin() -> Result<Vec<ServiceDescriptor>, ConfigError> {
    [zookeeper(), kafka(), cassandra(), scylla(), cosmos_nosql(), wiremock()]
        .into_iter()
        .map(ServiceDescriptorBuilder::build)
        .collect()
}

/// One entry of a services file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceEntry {
    name: String,
    image: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    command: Vec<String>,
    ports: Vec<PortSpec>,
    #[serde(default)]
    depends_on: Vec<String>,
    probe: ReadinessProbe,
    #[serde(default)]
    startup_timeout_secs: Option<u64>,
    #[serde(default)]
    readiness_max_retries: Option<u32>,
    #[serde(default)]
    readiness_interval_ms: Option<u64>,
    #[serde(default)]
    properties: Vec<PropertyBinding>,
    #[serde(default)]
    remote: Option<RemoteOverride>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServicesFile {
    services: Vec<ServiceEntry>,
}

impl ServiceEntry {
    fn into_descriptor(self) -> Result<ServiceDescriptor, ConfigError> {
        let mut builder = ServiceDescriptor::builder(self.name, self.image)
            .command(self.command)
            .probe(self.probe);

        if let Some(alias) = self.alias {
            builder = builder.alias(alias);
        }
        for (key, value) in self.environment {
            builder = builder.env(key, value);
        }
        for port in self.ports {
            builder = match port.host {
                Some(host) => builder.expose_fixed(port.container, host),
                None => builder.expose(port.container),
            };
        }
        for dependency in self.depends_on {
            builder = builder.depends_on(dependency);
        }
        if let Some(secs) = self.startup_timeout_secs {
            builder = builder.startup_timeout(Duration::from_secs(secs));
        }
        if self.readiness_max_retries.is_some() || self.readiness_interval_ms.is_some() {
            builder = builder.readiness(
                self.readiness_max_retries
                    .unwrap_or(crate::descriptor::DEFAULT_READINESS_MAX_RETRIES),
                self.readiness_interval_ms
                    .map_or(crate::descriptor::DEFAULT_READINESS_RETRY_INTERVAL, Duration::from_millis),
            );
        }
        for binding in self.properties {
            builder = builder.property(binding.key, binding.template);
        }
        if let Some(remote) = self.remote {
            builder = builder.remote_vars(remote.endpoint_var, remote.credential_var);
        }
        if let Some(credential) = self.credential {
            builder = builder.credential(credential);
        }

        builder.build()
    }
}

/// Parse descriptors from services-file JSON. `origin` names the source in errors.
pub fn parse_services(json: &str, origin: &str) -> Result<Vec<ServiceDescriptor>, ConfigError> {
    let file: ServicesFile =
        serde_json::from_str(json).map_err(|e| ConfigError::ServicesFile {
            path: origin.to_string(),
            message: e.to_string(),
        })?;

    file.services
        .into_iter()
        .map(ServiceEntry::into_descriptor)
        .collect()
}

/// Load extra descriptors from a JSON services file.
pub fn load_services_file(path: &Path) -> Result<Vec<ServiceDescriptor>, ConfigError> {
    let origin = path.display().to_string();
    let json = std::fs::read_to_string(path).map_err(|e| ConfigError::ServicesFile {
        path: origin.clone(),
        message: e.to_string(),
    })?;
    parse_services(&json, &origin)
}
