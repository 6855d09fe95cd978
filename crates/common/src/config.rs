//! Environment-variable settings parsing shared by Testbed configuration.
//!
//! Settings are read from a `HashMap` snapshot of the process environment so
//! callers can test configuration without touching the real environment.

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while reading a single setting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingError {
    #[error("{key} must be a valid positive integer, got '{value}'")]
    NotAnInteger { key: String, value: String },

    #[error("{key} must be greater than 0")]
    Zero { key: String },

    #[error("{key} must be one of {expected}, got '{value}'")]
    UnknownVariant {
        key: String,
        value: String,
        expected: String,
    },
}

/// Read a positive integer setting, falling back to `default` when unset.
///
/// Empty values are treated as unset.
///
/// # Errors
///
/// Returns [`SettingError::NotAnInteger`] when the value does not parse and
/// [`SettingError::Zero`] when it parses to zero.
pub fn positive<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, SettingError>
where
    T: FromStr + PartialEq + Default,
{
    match optional_positive(vars, key)? {
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// Read a positive integer setting that has no default.
///
/// # Errors
///
/// Same as [`positive`].
pub fn optional_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, SettingError>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = non_empty(vars, key) else {
        return Ok(None);
    };

    let value: T = raw.parse().map_err(|_| SettingError::NotAnInteger {
        key: key.to_string(),
        value: raw.to_string(),
    })?;

    if value == T::default() {
        return Err(SettingError::Zero {
            key: key.to_string(),
        });
    }

    Ok(Some(value))
}

/// Read a comma-separated list, trimming entries and dropping empty ones.
///
/// Returns `None` when the variable is unset so callers can tell "not
/// configured" apart from "configured as empty".
#[must_use]
pub fn list(vars: &HashMap<String, String>, key: &str) -> Option<Vec<String>> {
    vars.get(key).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Read a string setting, treating an empty or whitespace-only value as unset.
#[must_use]
pub fn non_empty<'a>(vars: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    vars.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

/// Upper-snake form of a service name for variable names (`cosmos-nosql` → `COSMOS_NOSQL`).
#[must_use]
pub fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
