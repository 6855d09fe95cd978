//! Secret types for protecting credential material from accidental logging.
//!
//! This module re-exports types from the [`secrecy`] crate. Endpoint
//! credentials (emulator master keys, passwords handed over through remote
//! override variables) are held as [`SecretString`] so that any struct that
//! derives `Debug` and carries one, including resolved endpoints and
//! configuration snapshots, redacts it automatically in logs and test
//! failure output.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use secrecy::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct RemoteDocumentStore {
//!     endpoint: String,
//!     key: SecretString,  // Debug shows "[REDACTED]"
//! }
//!
//! let store = RemoteDocumentStore {
//!     endpoint: "https://example.documents.azure.com:443/".to_string(),
//!     key: SecretString::from("c2VjcmV0"),
//! };
//!
//! println!("{:?}", store);
//!
//! // Reading the value is always an explicit call.
//! let key: &str = store.key.expose_secret();
//! ```
//!
//! Rendering a credential into an application property is the one place
//! where the value is exposed on purpose.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("emulator-master-key");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("emulator-master-key"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("key==");
        assert_eq!(secret.expose_secret(), "key==");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct Credential {
            endpoint: String,
            key: SecretString,
        }

        let json = r#"{"endpoint": "https://localhost:8081", "key": "abc123=="}"#;
        let cred: Credential = serde_json::from_str(json).expect("deserialize");

        assert_eq!(cred.key.expose_secret(), "abc123==");

        let debug = format!("{cred:?}");
        assert!(debug.contains("https://localhost:8081"));
        assert!(!debug.contains("abc123=="));
    }
}
