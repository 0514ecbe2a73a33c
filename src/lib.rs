//! XMPP session core with opportunistic end-to-end encryption.
//!
//! The crate owns everything between the TCP socket and the embedder's UI:
//! transport bootstrap (SRV resolution, STARTTLS or direct TLS against a
//! configurable trust anchor), stream negotiation, a stanza dispatch
//! table, per-device presence tracking, roster reconciliation, and the
//! trust bookkeeping around an externally supplied encryption handshake
//! engine.
//!
//! Typical use: build a [`Config`], implement [`EncryptionEngine`] (or
//! plug in an existing handshake library), call [`connect`], then hand the
//! returned session to [`ClientSession::run_receive_loop`]. Everything the
//! user should see flows through [`UserCallbacks`].

pub mod client;
pub mod config;
pub mod contact;
mod encryption;
pub mod engine;
pub mod error;
pub mod jid;
pub mod roster;
mod router;
pub mod session;
mod setup;
pub mod stanza;
pub mod transport;

pub use client::{connect, establish, ClientSession, UserCallbacks, SYSTEM_ORIGIN};
pub use config::{Config, TrustAnchor};
pub use engine::{EncryptionEngine, HandshakeEvent, Outcome};
pub use error::Error;
pub use jid::Jid;
