//! Stanza dispatch.
//!
//! One table maps (namespace, local name) to a handler tag; `dispatch`
//! parses a raw stanza, looks up the handler, and hands off. Parse
//! failures and unknown namespaces never escape: a bad stanza costs at
//! most one reply or one log line, the loop keeps running.

use crate::client::{ClientSession, SYSTEM_ORIGIN};
use crate::engine::EncryptionEngine;
use crate::roster::push_authorized;
use crate::session::Availability;
use crate::stanza::{
    iq_error_bad_request, iq_error_service_unavailable, iq_result_empty, iq_version_result,
    Iq, IqKind, ItemSubscription, Presence, PresenceKind, Stanza, NS_CLIENT, NS_ROSTER,
    NS_VERSION,
};
use tracing::{debug, info, warn};

/// Decoy answers for software-version probes. Deliberately not real
/// product data: scanners harvesting version strings get injection-bait
/// instead.
const DECOY_NAME: &str = "sh";
const DECOY_VERSION: &str = "$(cat /etc/passwd)";
const DECOY_OS: &str = "`uname -a`";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    Version,
    RosterPush,
    Message,
    Presence,
}

impl<E: EncryptionEngine> ClientSession<E> {
    /// Populate the dispatch table. Called once, after stream negotiation;
    /// until then nothing is routed.
    pub(crate) fn install_handlers(&mut self) {
        let entries = [
            (NS_VERSION, "query", Handler::Version),
            (NS_ROSTER, "query", Handler::RosterPush),
            (NS_CLIENT, "message", Handler::Message),
            (NS_CLIENT, "presence", Handler::Presence),
        ];
        for (ns, tag, handler) in entries {
            self.handlers
                .insert((ns.to_string(), tag.to_string()), handler);
        }
        debug!(handlers = self.handlers.len(), "dispatch table installed");
    }

    fn handler(&self, ns: &str, tag: &str) -> Option<Handler> {
        self.handlers
            .get(&(ns.to_string(), tag.to_string()))
            .copied()
    }

    /// Route one raw stanza to its handler.
    pub(crate) async fn dispatch(&mut self, xml: &str) {
        if self.trace_stanzas {
            debug!(stanza = %xml, "inbound");
        }
        let stanza = match Stanza::parse(xml) {
            Ok(stanza) => stanza,
            Err(e) => {
                warn!(error = %e, "dropping unparseable stanza");
                self.callbacks
                    .line(SYSTEM_ORIGIN, &format!("dropped malformed stanza: {}", e));
                return;
            }
        };
        match stanza {
            Stanza::Message(msg) => {
                if self.handler(NS_CLIENT, "message") == Some(Handler::Message) {
                    self.on_message(msg).await;
                }
            }
            Stanza::Presence(presence) => {
                if self.handler(NS_CLIENT, "presence") == Some(Handler::Presence) {
                    self.on_presence(presence);
                }
            }
            Stanza::Iq(iq) => self.on_iq(iq).await,
        }
    }

    async fn on_iq(&mut self, iq: Iq) {
        match iq.kind {
            IqKind::Result | IqKind::Error => {
                // Responses to requests we no longer have pending.
                debug!(id = ?iq.id, kind = ?iq.kind, "iq response outside any exchange");
                return;
            }
            IqKind::Get | IqKind::Set => {}
        }
        let handler = iq
            .payload
            .as_ref()
            .and_then(|p| self.handler(&p.ns, &p.tag));
        let reply = match handler {
            Some(Handler::Version) => self.answer_version(&iq),
            Some(Handler::RosterPush) => self.answer_roster_push(&iq),
            _ => {
                debug!(
                    ns = iq.payload.as_ref().map(|p| p.ns.as_str()).unwrap_or(""),
                    "unhandled iq namespace"
                );
                iq_error_service_unavailable(iq.id.as_deref(), iq.from.as_ref())
            }
        };
        self.send_or_fail(&reply).await;
    }

    fn answer_version(&mut self, iq: &Iq) -> String {
        match iq.kind {
            IqKind::Get => {
                info!(from = ?iq.from.as_ref().map(|j| j.to_string()), "version probe answered");
                iq_version_result(
                    iq.id.as_deref(),
                    iq.from.as_ref(),
                    DECOY_NAME,
                    DECOY_VERSION,
                    DECOY_OS,
                )
            }
            _ => iq_error_bad_request(iq.id.as_deref(), iq.from.as_ref()),
        }
    }

    fn answer_roster_push(&mut self, iq: &Iq) -> String {
        let bad_request = || iq_error_bad_request(iq.id.as_deref(), iq.from.as_ref());
        if iq.kind != IqKind::Set {
            return bad_request();
        }
        if !push_authorized(iq.from.as_ref(), iq.to.as_ref()) {
            warn!(from = ?iq.from.as_ref().map(|j| j.to_string()),
                "rejecting roster push from foreign address");
            return bad_request();
        }
        let items = iq.payload.as_ref().map(|p| p.items.as_slice()).unwrap_or(&[]);
        let item = match items {
            [item] => item,
            other => {
                warn!(items = other.len(), "roster push must carry exactly one item");
                return bad_request();
            }
        };
        if item.subscription == ItemSubscription::Remove {
            // Removals are filtered here, upholding the synchronizer's
            // no-remove contract. The entry and its trust state stay.
            warn!(contact = %item.jid.bare(), "roster removal push ignored");
            self.callbacks.line(
                SYSTEM_ORIGIN,
                &format!("ignoring roster removal for {}", item.jid.bare()),
            );
            return iq_result_empty(iq.id.as_deref(), iq.from.as_ref());
        }
        let contact = self.roster.apply_item(item);
        let text = format!(
            "roster update: {} [{}]",
            contact.bare(),
            contact.subscription.label()
        );
        let bare = contact.bare().to_string();
        self.callbacks.line(SYSTEM_ORIGIN, &text);
        self.callbacks.refresh(&bare);
        iq_result_empty(iq.id.as_deref(), iq.from.as_ref())
    }

    fn on_presence(&mut self, presence: Presence) {
        let Some(from) = presence.from else {
            warn!("presence without origin dropped");
            self.callbacks
                .line(SYSTEM_ORIGIN, "dropped presence without origin");
            return;
        };
        let bare = from.bare().to_string();

        let target = match presence.kind {
            None => Availability::from_show(presence.show),
            Some(PresenceKind::Unavailable) => Availability::Offline,
            Some(kind) => {
                // Subscription traffic and errors never touch the
                // availability machine.
                self.callbacks
                    .line(&bare, &format!("presence: {}", kind.label()));
                return;
            }
        };

        let resource = from.resource().unwrap_or("").to_string();
        let known = self.roster.listed(&bare);
        let sid = self.sessions.find_or_create(&bare, &resource, !known);
        self.roster.find_or_add(&bare).active.insert(sid);

        let Some(session) = self.sessions.get_mut(sid) else {
            return;
        };
        let (old, new) = session.transition(target, presence.priority, presence.status);
        let suffix = session
            .status
            .as_deref()
            .map(|s| format!(" ({})", s))
            .unwrap_or_default();
        let dispose = session.dispose;
        let text = format!("{}>{} [{}]{}", old.symbol(), new.symbol(), new.label(), suffix);
        debug!(contact = %bare, resource = %resource, transition = %text, "presence");
        self.callbacks.line(&bare, &text);
        self.callbacks.refresh(&bare);

        if new == Availability::Offline && dispose {
            self.sessions.remove(sid);
            if let Some(contact) = self.roster.get_mut(&bare) {
                contact.active.remove(&sid);
            }
            debug!(contact = %bare, resource = %resource, "disposable session removed");
        }
    }
}
