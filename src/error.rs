//! Error taxonomy for the session core.
//!
//! Transport-level failures (resolve, connect, TLS upgrade) carry distinct
//! variants because the caller is expected to report them differently: a
//! failed TLS upgrade on an otherwise reachable server can indicate a
//! downgrade attempt and must not be folded into a generic connect error.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// DNS/SRV resolution yielded no usable endpoint.
    #[error("failed to resolve {domain}: {reason}")]
    Resolve { domain: String, reason: String },

    /// TCP connection to a resolved endpoint failed.
    #[error("failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    /// The STARTTLS negotiation or the TLS handshake itself failed.
    /// Reported distinctly from `Connect`: the peer was reachable.
    #[error("TLS upgrade with {host} failed: {reason}")]
    TlsUpgrade { host: String, reason: String },

    /// A trust anchor could not be constructed (unreadable CA file,
    /// malformed pin, empty system root store).
    #[error("trust anchor unusable ({anchor}): {reason}")]
    TrustAnchor { anchor: String, reason: String },

    /// The CA file could not be read.
    #[error("cannot read CA file {path}: {source}")]
    CaFile {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Stream negotiation (SASL, bind, roster fetch) went off the rails.
    #[error("stream negotiation failed: {0}")]
    Negotiation(String),

    /// A stanza could not be parsed. Contained to the offending stanza by
    /// the dispatch loop; surfaced only from the negotiation phase.
    #[error("malformed stanza: {0}")]
    Parse(String),

    /// An outbound write on the channel failed.
    #[error("send failed: {0}")]
    Send(std::io::Error),

    /// The transport closed underneath us.
    #[error("transport closed")]
    Closed,
}
