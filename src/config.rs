//! Connection configuration.
//!
//! Everything the bootstrapper and the negotiation phase need is carried
//! here explicitly — including stanza tracing, which is a plain config
//! field rather than ambient global state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the TLS peer is authenticated during the transport upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrustAnchor {
    /// System root certificate store (rustls-native-certs).
    System,
    /// PEM bundle with the accepted certificate authorities.
    CaFile(PathBuf),
    /// Pin a single server certificate by the lowercase hex SHA-256 of its
    /// DER encoding. Signature checks still run; any certificate whose
    /// digest differs is rejected regardless of chain validity.
    Pinned { sha256: String },
}

impl Default for TrustAnchor {
    fn default() -> Self {
        TrustAnchor::System
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Account address, bare form (`user@domain`).
    pub jid: String,
    pub password: String,
    /// Explicit `host:port` override. When absent the account domain is
    /// resolved via SRV records.
    pub server: Option<String>,
    /// Device identifier requested at resource binding.
    pub resource: String,
    pub trust: TrustAnchor,
    /// Log every raw inbound/outbound stanza at debug level. Off by
    /// default: stanza bodies can contain message text.
    pub trace_stanzas: bool,
}

impl Config {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Config {
            jid: jid.into(),
            password: password.into(),
            server: None,
            resource: "wisp".to_string(),
            trust: TrustAnchor::System,
            trace_stanzas: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("alice@example.com", "hunter2");
        assert_eq!(config.resource, "wisp");
        assert!(config.server.is_none());
        assert!(!config.trace_stanzas);
        assert!(matches!(config.trust, TrustAnchor::System));
    }
}
