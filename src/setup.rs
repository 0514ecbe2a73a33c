//! Post-TLS stream negotiation: SASL, resource binding, roster fetch.
//!
//! Runs once per connection on the already-encrypted channel, before the
//! dispatch table exists. Server answers in this phase are matched with
//! plain substring checks against the framed XML; only the roster result
//! goes through the full stanza parser, because its items feed the
//! contact table.

use crate::client::ClientSession;
use crate::config::Config;
use crate::engine::EncryptionEngine;
use crate::error::Error;
use crate::jid::Jid;
use crate::stanza::framing::{next_frame, Frame};
use crate::stanza::{Iq, IqKind, ItemSubscription, RosterItem, Stanza, NS_ROSTER};
use crate::transport::Channel;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use quick_xml::escape::escape;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Deadline for the whole negotiation, stream open through roster result.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

const ID_BIND: &str = "bind-1";
const ID_ROSTER: &str = "roster-1";

struct Exchange<'a> {
    channel: &'a mut Channel,
    buffer: &'a mut Vec<u8>,
    deadline: Instant,
}

impl Exchange<'_> {
    async fn send(&mut self, xml: &str) -> Result<(), Error> {
        self.channel.send(xml.as_bytes()).await
    }

    /// Next complete frame off the wire, within the negotiation deadline.
    async fn next(&mut self) -> Result<Frame, Error> {
        loop {
            if let Some((frame, used)) = next_frame(self.buffer) {
                self.buffer.drain(..used);
                return Ok(frame);
            }
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Negotiation(
                    "timed out waiting for the server".to_string(),
                ));
            }
            let mut read_buf = [0u8; 8192];
            let n = tokio::time::timeout(remaining, self.channel.recv(&mut read_buf))
                .await
                .map_err(|_| {
                    Error::Negotiation("timed out waiting for the server".to_string())
                })?
                .map_err(|e| Error::Negotiation(format!("read failed: {}", e)))?;
            if n == 0 {
                return Err(Error::Closed);
            }
            self.buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    /// Next stanza, skipping stream headers. A stream footer here means
    /// the server gave up on us mid-negotiation.
    async fn next_stanza(&mut self) -> Result<String, Error> {
        loop {
            match self.next().await? {
                Frame::Stanza(xml) => return Ok(xml),
                Frame::StreamHeader(_) => {}
                Frame::StreamEnd => {
                    return Err(Error::Negotiation(
                        "server closed the stream during negotiation".to_string(),
                    ))
                }
            }
        }
    }

    async fn open_stream(&mut self, domain: &str) -> Result<(), Error> {
        let open = format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            escape(domain)
        );
        self.send(&open).await?;
        loop {
            match self.next().await? {
                Frame::StreamHeader(_) => return Ok(()),
                Frame::Stanza(xml) => {
                    debug!(stanza = %xml, "stanza before stream header");
                }
                Frame::StreamEnd => {
                    return Err(Error::Negotiation(
                        "server closed the stream during negotiation".to_string(),
                    ))
                }
            }
        }
    }
}

/// Drive the negotiation for `session`: authenticate, bind the resource,
/// install handlers, fetch the roster, announce presence.
pub(crate) async fn negotiate<E: EncryptionEngine>(
    session: &mut ClientSession<E>,
    config: &Config,
) -> Result<(), Error> {
    let account = session.me.clone();
    let domain = account.domain().to_string();
    let deadline = Instant::now() + NEGOTIATION_TIMEOUT;
    let bound = {
        let mut io = Exchange {
            channel: &mut session.channel,
            buffer: &mut session.buffer,
            deadline,
        };
        authenticate(&mut io, &account, &domain, &config.password).await?;
        bind_resource(&mut io, &account, &domain, &config.resource).await?
    };

    info!(jid = %bound, "resource bound");
    session.me = bound;
    session.install_handlers();

    let items = {
        let mut io = Exchange {
            channel: &mut session.channel,
            buffer: &mut session.buffer,
            deadline,
        };
        fetch_roster(&mut io).await?
    };

    for item in &items {
        if item.subscription == ItemSubscription::Remove {
            // Not part of a full fetch; a server sending one anyway does
            // not get to crash the synchronizer.
            warn!(contact = %item.jid.bare(), "remove item in roster result ignored");
            continue;
        }
        session.roster.apply_item(item);
    }
    info!(contacts = session.roster.len(), "roster loaded");

    // Initial presence. A failed announce is reported through the failure
    // sink, not fatal: the session is already authenticated and usable.
    session.send_or_fail("<presence/>").await;
    Ok(())
}

async fn authenticate(
    io: &mut Exchange<'_>,
    account: &Jid,
    domain: &str,
    password: &str,
) -> Result<(), Error> {
    io.open_stream(domain).await?;
    let features = io.next_stanza().await?;
    if !features.contains("PLAIN") {
        return Err(Error::Negotiation(
            "server does not offer SASL PLAIN".to_string(),
        ));
    }

    let local = match account.bare().split_once('@') {
        Some((local, _)) => local,
        None => account.bare(),
    };
    let token = BASE64.encode(format!("\0{}\0{}", local, password));
    io.send(&format!(
        "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
        token
    ))
    .await?;

    let answer = io.next_stanza().await?;
    if answer.contains("<failure") {
        return Err(Error::Negotiation(
            "authentication failed: credentials rejected".to_string(),
        ));
    }
    if !answer.contains("<success") {
        return Err(Error::Negotiation(format!(
            "unexpected authentication answer: {}",
            answer
        )));
    }
    debug!("authenticated");
    Ok(())
}

async fn bind_resource(
    io: &mut Exchange<'_>,
    account: &Jid,
    domain: &str,
    resource: &str,
) -> Result<Jid, Error> {
    // Authentication resets the stream; open it again.
    io.open_stream(domain).await?;
    let features = io.next_stanza().await?;
    if !features.contains("<bind") {
        return Err(Error::Negotiation(
            "server does not offer resource binding".to_string(),
        ));
    }

    io.send(&format!(
        "<iq type='set' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind></iq>",
        ID_BIND,
        escape(resource)
    ))
    .await?;

    let answer = io.next_stanza().await?;
    if answer.contains("<error") {
        return Err(Error::Negotiation(format!(
            "resource binding rejected: {}",
            answer
        )));
    }
    // The server may assign a different resource than requested; take its
    // word for the bound address.
    let bound = answer
        .find("<jid>")
        .zip(answer.find("</jid>"))
        .and_then(|(start, end)| answer.get(start + "<jid>".len()..end))
        .and_then(Jid::parse);
    Ok(bound.unwrap_or_else(|| {
        Jid::parse(&format!("{}/{}", account.bare(), resource))
            .unwrap_or_else(|| account.clone())
    }))
}

async fn fetch_roster(io: &mut Exchange<'_>) -> Result<Vec<RosterItem>, Error> {
    io.send(&format!(
        "<iq type='get' id='{}'><query xmlns='{}'/></iq>",
        ID_ROSTER, NS_ROSTER
    ))
    .await?;
    loop {
        let xml = io.next_stanza().await?;
        let iq = match Stanza::parse(&xml) {
            Ok(Stanza::Iq(iq)) if iq.id.as_deref() == Some(ID_ROSTER) => iq,
            Ok(_) => {
                debug!(stanza = %xml, "stanza before roster result dropped");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "unparseable stanza during roster fetch");
                continue;
            }
        };
        return roster_items(iq);
    }
}

fn roster_items(iq: Iq) -> Result<Vec<RosterItem>, Error> {
    match iq.kind {
        IqKind::Result => Ok(iq.payload.map(|p| p.items).unwrap_or_default()),
        _ => Err(Error::Negotiation("roster fetch rejected".to_string())),
    }
}
