//! # Testbed Test Utilities
//!
//! Shared test utilities for the testbed crates.
//!
//! This crate provides:
//! - `FakeRuntime`: in-memory container runtime with scripted failures
//! - `ScriptedProbes`: probe runner with per-service scripted outcomes
//! - Descriptor fixtures
//! - Idempotent tracing setup for test binaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use testbed_test_utils::*;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_example() {
//!     init_test_tracing();
//!     let runtime = Arc::new(FakeRuntime::new());
//!     runtime.fail_start("zookeeper", "image not found");
//!
//!     let testbed = Testbed::builder(runtime.clone())
//!         .services(vec![tcp_service("zookeeper", 2181).build().unwrap()])
//!         .probe_runner(Arc::new(ScriptedProbes::all_ready()))
//!         .config(TestbedConfig::default())
//!         .env(HashMap::new())
//!         .build()?;
//! }
//! ```

pub mod fake_runtime;
pub mod fixtures;
pub mod logging;
pub mod scripted_probes;

// Re-export commonly used items
pub use fake_runtime::*;
pub use fixtures::*;
pub use logging::*;
pub use scripted_probes::*;
