//! Descriptor and environment fixtures.

use std::collections::HashMap;
use std::time::Duration;
use testbed::config::TestbedConfig;
use testbed::descriptor::{ReadinessProbe, ServiceDescriptor, ServiceDescriptorBuilder};
use testbed::plan::Selection;

/// Fixed image used by fixture services; never pulled.
pub const TEST_IMAGE: &str = "testbed/fixture:1";

/// Service probed over TCP on `port`.
pub fn tcp_service(name: &str, port: u16) -> ServiceDescriptorBuilder {
    ServiceDescriptor::builder(name, TEST_IMAGE)
        .expose(port)
        .probe(ReadinessProbe::tcp(port))
        .property(format!("{name}.address"), "{address}")
}

/// Build a list of fixture services; `deps` pairs are (service, dependency).
pub fn services(names: &[(&str, u16)], deps: &[(&str, &str)]) -> Vec<ServiceDescriptor> {
    names
        .iter()
        .map(|(name, port)| {
            deps.iter()
                .filter(|(service, _)| service == name)
                .fold(tcp_service(name, *port), |builder, (_, dep)| {
                    builder.depends_on(*dep)
                })
                .build()
                .expect("fixture descriptor must be valid")
        })
        .collect()
}

/// Configuration for tests: static selection, default bounds.
pub fn test_config() -> TestbedConfig {
    TestbedConfig::default()
}

/// Configuration enabling only `services`.
pub fn opt_in_config(services: &[&str]) -> TestbedConfig {
    TestbedConfig {
        selection: Selection::opt_in(services.iter().copied()),
        ..TestbedConfig::default()
    }
}

/// Configuration with a short readiness budget for fast failure tests.
pub fn quick_readiness_config(max_retries: u32, interval: Duration) -> TestbedConfig {
    TestbedConfig {
        readiness_max_retries: Some(max_retries),
        readiness_retry_interval: Some(interval),
        ..TestbedConfig::default()
    }
}

pub fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}
