//! Common utilities and types shared across Testbed crates.

#![warn(clippy::pedantic)]

/// Module for common data types
pub mod types;

/// Module for environment-variable settings parsing
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
