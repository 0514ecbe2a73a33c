//! Session facade: connect, negotiate, run the receive loop.
//!
//! `connect` owns the whole bring-up path (bootstrap, stream negotiation,
//! handler installation, roster fetch, initial presence) and hands back a
//! `ClientSession` ready for `run_receive_loop`. All failures before that
//! point are reported through the caller's callbacks; the caller simply
//! gets no session.

use crate::config::Config;
use crate::engine::EncryptionEngine;
use crate::error::Error;
use crate::jid::Jid;
use crate::roster::Roster;
use crate::router::Handler;
use crate::session::SessionStore;
use crate::stanza::framing::{next_frame, Frame};
use crate::transport::{self, Channel};
use crate::{setup, stanza};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Origin id for lines that belong to no contact conversation.
pub const SYSTEM_ORIGIN: &str = "***";

/// Upper bound on buffered bytes without a complete stanza. A peer
/// streaming one unterminated element forever would otherwise grow the
/// buffer without limit.
const MAX_PENDING_BYTES: usize = 1024 * 1024;

/// How the core talks back to its embedder. `received` appends a log line
/// to the conversation keyed by the origin id (a bare address, or
/// [`SYSTEM_ORIGIN`]); `notify` flags a contact's conversation as updated;
/// `failure` carries errors that are not tied to a conversation.
pub struct UserCallbacks {
    pub received: Box<dyn FnMut(&str, &str) + Send>,
    pub notify: Box<dyn FnMut(&str) + Send>,
    pub failure: Box<dyn FnMut(Error) + Send>,
}

impl UserCallbacks {
    pub fn new(
        received: impl FnMut(&str, &str) + Send + 'static,
        notify: impl FnMut(&str) + Send + 'static,
        failure: impl FnMut(Error) + Send + 'static,
    ) -> UserCallbacks {
        UserCallbacks {
            received: Box::new(received),
            notify: Box::new(notify),
            failure: Box::new(failure),
        }
    }

    pub(crate) fn line(&mut self, origin: &str, text: &str) {
        (self.received)(origin, text);
    }

    pub(crate) fn refresh(&mut self, bare: &str) {
        (self.notify)(bare);
    }

    pub(crate) fn fail(&mut self, err: Error) {
        (self.failure)(err);
    }
}

/// One established, authenticated session and all of its mutable state:
/// the contact table, the per-device session arena, the handshake engine,
/// and the dispatch table.
pub struct ClientSession<E: EncryptionEngine> {
    pub(crate) channel: Channel,
    /// Our bound full address, as assigned by the server.
    pub(crate) me: Jid,
    pub(crate) roster: Roster,
    pub(crate) sessions: SessionStore<E::Context>,
    pub(crate) engine: E,
    pub(crate) handlers: HashMap<(String, String), Handler>,
    pub(crate) callbacks: UserCallbacks,
    pub(crate) trace_stanzas: bool,
    pub(crate) buffer: Vec<u8>,
}

/// Resolve, connect, upgrade the transport, and negotiate the stream.
/// Every failure is reported through `callbacks` and yields `None`.
pub async fn connect<E: EncryptionEngine>(
    config: Config,
    engine: E,
    mut callbacks: UserCallbacks,
) -> Option<ClientSession<E>> {
    let established = match transport::bootstrap(&config).await {
        Ok(established) => established,
        Err(e) => {
            callbacks.line(SYSTEM_ORIGIN, &e.to_string());
            callbacks.fail(e);
            return None;
        }
    };
    if let Some(summary) = &established.tls_summary {
        callbacks.line(SYSTEM_ORIGIN, summary);
    }
    establish(established.channel, config, engine, callbacks).await
}

/// Negotiate the stream (auth, bind, roster fetch, initial presence) over
/// an already-established channel. Split from [`connect`] so the whole
/// protocol layer can run over an in-memory pipe.
pub async fn establish<E: EncryptionEngine>(
    channel: Channel,
    config: Config,
    engine: E,
    mut callbacks: UserCallbacks,
) -> Option<ClientSession<E>> {
    let account = match Jid::parse(&config.jid) {
        Some(jid) => jid,
        None => {
            let e = Error::Negotiation(format!("'{}' is not a valid account address", config.jid));
            callbacks.line(SYSTEM_ORIGIN, &e.to_string());
            callbacks.fail(e);
            return None;
        }
    };
    let mut session = ClientSession {
        channel,
        me: account,
        roster: Roster::default(),
        sessions: SessionStore::default(),
        engine,
        handlers: HashMap::new(),
        callbacks,
        trace_stanzas: config.trace_stanzas,
        buffer: Vec::new(),
    };
    match setup::negotiate(&mut session, &config).await {
        Ok(()) => {
            info!(jid = %session.me, contacts = session.roster.len(), "session established");
            Some(session)
        }
        Err(e) => {
            session.callbacks.line(SYSTEM_ORIGIN, &e.to_string());
            session.callbacks.fail(e);
            session.channel.close().await;
            None
        }
    }
}

impl<E: EncryptionEngine> ClientSession<E> {
    /// Our bound full address.
    pub fn jid(&self) -> &Jid {
        &self.me
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Mutable contact table access, e.g. to mark a fingerprint verified
    /// after an out-of-band comparison.
    pub fn roster_mut(&mut self) -> &mut Roster {
        &mut self.roster
    }

    /// Serialize and send one stanza; a failed write goes to the failure
    /// sink instead of unwinding the calling handler.
    pub(crate) async fn send_or_fail(&mut self, xml: &str) {
        if self.trace_stanzas {
            debug!(stanza = %xml, "outbound");
        }
        if let Err(e) = self.channel.send(xml.as_bytes()).await {
            self.callbacks.fail(e);
        }
    }

    /// Send an outgoing chat message to a full address, as-is. Encrypting
    /// the body first is the embedder's business via its handshake layer.
    pub async fn send_message(&mut self, to: &Jid, body: &str) {
        let xml = stanza::message_stanza(to, body);
        self.send_or_fail(&xml).await;
    }

    /// Drive the session until the server closes the stream or the
    /// transport dies. Stanzas are handled strictly one at a time, in
    /// arrival order.
    pub async fn run_receive_loop(mut self) {
        let mut read_buf = vec![0u8; 8192];
        loop {
            while let Some((frame, used)) = next_frame(&self.buffer) {
                self.buffer.drain(..used);
                match frame {
                    Frame::StreamHeader(_) => debug!("stream header"),
                    Frame::StreamEnd => {
                        info!("server closed the stream");
                        self.callbacks.line(SYSTEM_ORIGIN, "server closed the stream");
                        self.channel.close().await;
                        return;
                    }
                    Frame::Stanza(xml) => self.dispatch(&xml).await,
                }
            }
            if self.buffer.len() > MAX_PENDING_BYTES {
                warn!(pending = self.buffer.len(), "unparseable backlog over limit, closing");
                self.callbacks
                    .fail(Error::Parse("oversized stanza".to_string()));
                self.channel.close().await;
                return;
            }
            match self.channel.recv(&mut read_buf).await {
                Ok(0) => {
                    info!("transport closed");
                    self.callbacks.line(SYSTEM_ORIGIN, "connection closed");
                    self.callbacks.fail(Error::Closed);
                    return;
                }
                Ok(n) => self.buffer.extend_from_slice(&read_buf[..n]),
                Err(e) => {
                    warn!(error = %e, "read failed");
                    self.callbacks
                        .line(SYSTEM_ORIGIN, &format!("read failed: {}", e));
                    self.callbacks.fail(Error::Closed);
                    return;
                }
            }
        }
    }
}
