//! Encryption session engine integration.
//!
//! Feeds inbound message bodies through the handshake engine bound to the
//! sender's device session and turns the resulting events into user-facing
//! lines: trust verdicts on session establishment, decrypted or plaintext
//! bodies, warnings. The context handed back by the engine replaces the
//! session's old one before anything awaits, so a second message for the
//! same device can never observe stale handshake state.

use crate::client::{ClientSession, SYSTEM_ORIGIN};
use crate::engine::{EncryptionEngine, HandshakeEvent, Outcome};
use crate::stanza::{message_stanza, Message};
use tracing::{debug, warn};

/// Trust verdict for a freshly established session, per fingerprint state:
/// whether this key is verified, whether any key of the contact is, and how
/// many sessions this key was seen in before.
pub(crate) fn trust_text(this_verified: bool, any_verified: bool, prior_uses: u32) -> String {
    if this_verified {
        return "verified fingerprint".to_string();
    }
    if any_verified {
        if prior_uses == 0 {
            return "possible breakin attempt! unverified key, but a verified fingerprint \
                    exists for this contact; verify the session id out of band"
                .to_string();
        }
        return format!(
            "unverified fingerprint (used {} times), verified fingerprint present; \
             please verify",
            prior_uses
        );
    }
    if prior_uses == 0 {
        "new unverified key, please verify".to_string()
    } else {
        format!("unverified key (used {} times), please verify", prior_uses)
    }
}

/// Session id as two hex halves. The bracketed half belongs to the
/// lower-priority side; `high` says our side spoke first and selects it.
pub(crate) fn session_id_text(high: bool, first: &[u8], second: &[u8]) -> String {
    if high {
        format!("session id: {} [{}]", hex::encode(first), hex::encode(second))
    } else {
        format!("session id: [{}] {}", hex::encode(first), hex::encode(second))
    }
}

impl<E: EncryptionEngine> ClientSession<E> {
    /// Message-stanza handler: drive the handshake for the sender's device.
    pub(crate) async fn on_message(&mut self, msg: Message) {
        let Some(from) = msg.from else {
            warn!("message without origin dropped");
            return;
        };
        // Empty bodies (chat states, receipts) are dropped without even a
        // placeholder line.
        let body = match msg.body {
            Some(ref body) if !body.is_empty() => body.clone(),
            _ => return,
        };

        let bare = from.bare().to_string();
        let resource = from.resource().unwrap_or("").to_string();
        let known = self.roster.listed(&bare);
        let sid = self.sessions.find_or_create(&bare, &resource, !known);
        self.roster.find_or_add(&bare).active.insert(sid);

        let ctx = self
            .sessions
            .get_mut(sid)
            .and_then(|s| s.encryption.take())
            .unwrap_or_else(|| self.engine.fresh_context());
        let Outcome {
            context,
            reply,
            events,
        } = self.engine.advance(ctx, &body);
        let peer_fp = self.engine.peer_fingerprint(&context);

        // Single-writer rule: the replacement context is in place before
        // the reply send below can suspend.
        if let Some(session) = self.sessions.get_mut(sid) {
            session.encryption = Some(context);
        }

        let mut lines: Vec<(String, String)> = Vec::new();
        for event in events {
            match event {
                HandshakeEvent::Established {
                    high,
                    sid_first,
                    sid_second,
                } => {
                    let contact = self.roster.find_or_add(&bare);
                    match peer_fp.as_deref() {
                        Some(fp) => {
                            let idx = contact.find_or_add_fingerprint(fp);
                            let any_verified = contact.has_verified_fingerprint();
                            let record = &contact.fingerprints[idx];
                            lines.push((
                                SYSTEM_ORIGIN.to_string(),
                                trust_text(record.verified, any_verified, record.session_count),
                            ));
                            lines.push((
                                SYSTEM_ORIGIN.to_string(),
                                session_id_text(high, &sid_first, &sid_second),
                            ));
                            contact.fingerprints[idx].session_count += 1;
                        }
                        None => {
                            warn!(contact = %bare, "established session without a fingerprint");
                            lines.push((
                                SYSTEM_ORIGIN.to_string(),
                                "inconsistent handshake state: established session \
                                 without a fingerprint"
                                    .to_string(),
                            ));
                        }
                    }
                }
                HandshakeEvent::Warning(text) => {
                    lines.push((SYSTEM_ORIGIN.to_string(), text));
                }
                HandshakeEvent::Plaintext(text) => {
                    lines.push((bare.clone(), format!("(plain) {}", text)));
                }
                HandshakeEvent::Decrypted(text) => {
                    lines.push((bare.clone(), text));
                }
                HandshakeEvent::RemoteError(text) => {
                    lines.push((bare.clone(), format!("error: {}", text)));
                }
            }
        }

        for (origin, text) in lines {
            self.callbacks.line(&origin, &text);
            self.callbacks.refresh(&bare);
        }

        if let Some(reply) = reply {
            debug!(to = %from, "sending handshake payload");
            let xml = message_stanza(&from, &reply);
            self.send_or_fail(&xml).await;
        }
    }
}
