//! Testbed Library
//!
//! Ephemeral backing services for integration test runs: brokers, column
//! stores, database emulators and HTTP mocks are started in containers,
//! gated on readiness, exposed through an endpoint registry and torn down
//! exactly once.
//!
//! # Architecture
//!
//! ```text
//! config + catalog -> plan -> provisioner (-> prober gate) -> registry
//!                                  |
//!                            runtime (docker)
//! ```
//!
//! # Modules
//!
//! - `catalog` - Built-in service descriptors and services-file loading
//! - `config` - Configuration from environment
//! - `controller` - Setup/teardown lifecycle (`Testbed`, `RunningTestbed`)
//! - `descriptor` - Declarative service definitions
//! - `docker` - Docker Engine runtime (feature `docker`)
//! - `errors` - Error types
//! - `plan` - Dependency-ordered run plans
//! - `prober` - Bounded-retry readiness probes
//! - `provisioner` - All-or-nothing container provisioning
//! - `registry` - Resolved endpoints and property injection
//! - `runtime` - Container engine seam

pub mod catalog;
pub mod config;
pub mod controller;
pub mod descriptor;
#[cfg(feature = "docker")]
pub mod docker;
pub mod errors;
pub mod plan;
pub mod prober;
pub mod provisioner;
pub mod registry;
pub mod runtime;

pub use config::TestbedConfig;
pub use controller::{RunningTestbed, Testbed, TestbedBuilder};
pub use descriptor::{ReadinessProbe, ServiceDescriptor};
pub use errors::{ConfigError, Result, TestbedError};
pub use plan::Selection;
pub use registry::{Endpoint, EndpointRegistry, PropertySink};
