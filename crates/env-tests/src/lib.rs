//! Environment Integration Test Suite
//!
//! This crate runs the testbed against a real Docker daemon: images are
//! pulled, containers started, readiness probed over real sockets and
//! everything torn down again.
//!
//! # Features
//!
//! - `smoke`: Daemon check and a single HTTP mock lifecycle (1min)
//! - `flows`: Broker (with its coordinator) and column store lifecycles (5-8min)
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. Docker daemon reachable (`DOCKER_HOST` or the default socket)
//! 2. Host port 29092 free (Kafka's host listener)
//! 3. Network access to pull images on first run
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs 0 env-tests (no default features)
//! cargo test
//!
//! # Smoke tests only
//! cargo test -p env-tests --features smoke
//!
//! # Full suite
//! cargo test -p env-tests --features all
//! ```

pub mod daemon;
pub mod eventual;
