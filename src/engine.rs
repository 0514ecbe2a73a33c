//! Seam between the session core and the encryption handshake library.
//!
//! The handshake cryptography (key agreement, MACs, session-id derivation)
//! lives behind this trait. The core threads an opaque per-device context
//! through `advance` by value: each call consumes the previous context and
//! returns its replacement, which keeps the single-writer rule visible in
//! the types — there is never an aliased mutable handle to live handshake
//! state.

/// Events surfaced by one `advance` call, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeEvent {
    /// The handshake completed and an encrypted session is up. `high` says
    /// which side spoke first and selects which session-id half gets
    /// bracketed for manual out-of-band comparison.
    Established {
        high: bool,
        sid_first: Vec<u8>,
        sid_second: Vec<u8>,
    },
    /// Advisory from the handshake layer, shown as a system line.
    Warning(String),
    /// Text that arrived outside any encrypted session.
    Plaintext(String),
    /// Text decrypted from an established session.
    Decrypted(String),
    /// Error message received from the peer's handshake layer.
    RemoteError(String),
}

/// Result of feeding one inbound body through the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<C> {
    /// Replacement context. Must be stored before anything suspends.
    pub context: C,
    /// Handshake payload to send back to the originating full address.
    pub reply: Option<String>,
    pub events: Vec<HandshakeEvent>,
}

/// The external handshake driver. Implementations own the cryptographic
/// state machine; the core owns routing, trust bookkeeping, and what the
/// user gets told.
pub trait EncryptionEngine {
    /// Opaque per-device handshake state.
    type Context;

    /// Context for a device we have not spoken to yet.
    fn fresh_context(&self) -> Self::Context;

    /// Feed one inbound message body through the handshake bound to `ctx`.
    fn advance(&mut self, ctx: Self::Context, body: &str) -> Outcome<Self::Context>;

    /// Stable fingerprint of the peer key bound to `ctx`, once known.
    fn peer_fingerprint(&self, ctx: &Self::Context) -> Option<Vec<u8>>;
}
