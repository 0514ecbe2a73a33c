//! Parsed stanza model and XML (de)serialization.
//!
//! Only the slice of the wire grammar the session core consumes is modeled:
//! message bodies, presence availability, and the IQ namespaces the router
//! answers. Everything else stays opaque text and is dropped at dispatch.

pub mod framing;

use crate::error::Error;
use crate::jid::Jid;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

pub const NS_CLIENT: &str = "jabber:client";
pub const NS_VERSION: &str = "jabber:iq:version";
pub const NS_ROSTER: &str = "jabber:iq:roster";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub body: Option<String>,
}

/// Presence subtypes other than plain availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Unavailable,
    Probe,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Error,
}

impl PresenceKind {
    pub fn label(self) -> &'static str {
        match self {
            PresenceKind::Unavailable => "unavailable",
            PresenceKind::Probe => "probe",
            PresenceKind::Subscribe => "subscribe",
            PresenceKind::Subscribed => "subscribed",
            PresenceKind::Unsubscribe => "unsubscribe",
            PresenceKind::Unsubscribed => "unsubscribed",
            PresenceKind::Error => "error",
        }
    }
}

/// `<show/>` availability detail on a type-less presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Show {
    Chat,
    Away,
    Dnd,
    Xa,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Presence {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub kind: Option<PresenceKind>,
    pub show: Option<Show>,
    pub priority: i8,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqKind {
    Get,
    Set,
    Result,
    Error,
}

/// First child element of an IQ, keyed by namespace and local name for
/// handler dispatch. Roster items are decoded eagerly when the namespace
/// matches; other payloads stay opaque.
#[derive(Debug, Clone, PartialEq)]
pub struct IqPayload {
    pub ns: String,
    pub tag: String,
    pub items: Vec<RosterItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Iq {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    pub kind: IqKind,
    pub payload: Option<IqPayload>,
}

/// Wire form of one roster entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterItem {
    pub jid: Jid,
    pub name: Option<String>,
    pub subscription: ItemSubscription,
    /// `ask='subscribe'` — an outbound subscription is pending.
    pub pending: bool,
    /// `approved='true'` — inbound subscription pre-approved.
    pub approved: bool,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSubscription {
    None,
    To,
    From,
    Both,
    Remove,
}

fn attr_string(attr: &quick_xml::events::attributes::Attribute<'_>) -> String {
    match attr.unescape_value() {
        Ok(v) => v.into_owned(),
        Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
    }
}

fn parse_err(what: impl Into<String>) -> Error {
    Error::Parse(what.into())
}

/// Read the text content of the element just opened, consuming events up
/// to and including its end tag.
fn read_text(reader: &mut Reader<&[u8]>) -> Result<String, Error> {
    let mut text = String::new();
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Text(t)) => {
                text.push_str(&t.unescape().map_err(|e| parse_err(e.to_string()))?)
            }
            Ok(Event::CData(c)) => text.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::Empty(_)) => {}
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Ok(text);
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Err(parse_err("truncated element")),
            Err(e) => return Err(parse_err(e.to_string())),
            _ => {}
        }
    }
}

/// Skip everything up to the end tag of the element just opened.
fn skip_element(reader: &mut Reader<&[u8]>) -> Result<(), Error> {
    let mut depth = 0u32;
    loop {
        match reader.read_event() {
            Ok(Event::Start(_)) => depth += 1,
            Ok(Event::End(_)) => {
                if depth == 0 {
                    return Ok(());
                }
                depth -= 1;
            }
            Ok(Event::Eof) => return Err(parse_err("truncated element")),
            Err(e) => return Err(parse_err(e.to_string())),
            _ => {}
        }
    }
}

struct Head {
    from: Option<Jid>,
    to: Option<Jid>,
    id: Option<String>,
    kind: Option<String>,
}

fn read_head(e: &quick_xml::events::BytesStart<'_>) -> Head {
    let mut head = Head {
        from: None,
        to: None,
        id: None,
        kind: None,
    };
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr_string(&attr);
        match key.as_str() {
            "from" => head.from = Jid::parse(&value),
            "to" => head.to = Jid::parse(&value),
            "id" => head.id = Some(value),
            "type" => head.kind = Some(value),
            _ => {}
        }
    }
    head
}

impl Stanza {
    /// Parse one complete stanza as cut out by the framing layer.
    pub fn parse(xml: &str) -> Result<Stanza, Error> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event() {
                Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) => continue,
                Ok(Event::Start(e)) => {
                    let name = e.name().local_name().as_ref().to_vec();
                    let head = read_head(&e);
                    return match name.as_slice() {
                        b"message" => parse_message(&mut reader, head, false),
                        b"presence" => parse_presence(&mut reader, head, false),
                        b"iq" => parse_iq(&mut reader, head, false),
                        other => Err(parse_err(format!(
                            "unexpected top-level element <{}>",
                            String::from_utf8_lossy(other)
                        ))),
                    };
                }
                Ok(Event::Empty(e)) => {
                    let name = e.name().local_name().as_ref().to_vec();
                    let head = read_head(&e);
                    return match name.as_slice() {
                        b"message" => parse_message(&mut reader, head, true),
                        b"presence" => parse_presence(&mut reader, head, true),
                        b"iq" => parse_iq(&mut reader, head, true),
                        other => Err(parse_err(format!(
                            "unexpected top-level element <{}>",
                            String::from_utf8_lossy(other)
                        ))),
                    };
                }
                Ok(Event::Eof) => return Err(parse_err("empty stanza")),
                Err(e) => return Err(parse_err(e.to_string())),
                _ => return Err(parse_err("unexpected stream content")),
            }
        }
    }
}

fn parse_message(
    reader: &mut Reader<&[u8]>,
    head: Head,
    empty: bool,
) -> Result<Stanza, Error> {
    let mut body = None;
    if !empty {
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if e.name().local_name().as_ref() == b"body" {
                        body = Some(read_text(reader)?);
                    } else {
                        skip_element(reader)?;
                    }
                }
                Ok(Event::Empty(_)) => {}
                Ok(Event::End(_)) | Ok(Event::Eof) => break,
                Err(e) => return Err(parse_err(e.to_string())),
                _ => {}
            }
        }
    }
    Ok(Stanza::Message(Message {
        from: head.from,
        to: head.to,
        id: head.id,
        body,
    }))
}

fn parse_presence_kind(kind: &str) -> Result<PresenceKind, Error> {
    match kind {
        "unavailable" => Ok(PresenceKind::Unavailable),
        "probe" => Ok(PresenceKind::Probe),
        "subscribe" => Ok(PresenceKind::Subscribe),
        "subscribed" => Ok(PresenceKind::Subscribed),
        "unsubscribe" => Ok(PresenceKind::Unsubscribe),
        "unsubscribed" => Ok(PresenceKind::Unsubscribed),
        "error" => Ok(PresenceKind::Error),
        other => Err(parse_err(format!("unknown presence type '{}'", other))),
    }
}

fn parse_presence(
    reader: &mut Reader<&[u8]>,
    head: Head,
    empty: bool,
) -> Result<Stanza, Error> {
    let kind = match head.kind.as_deref() {
        Some(k) => Some(parse_presence_kind(k)?),
        None => None,
    };
    let mut show = None;
    let mut status = None;
    let mut priority = 0i8;
    if !empty {
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => match e.name().local_name().as_ref() {
                    b"show" => {
                        show = match read_text(reader)?.trim() {
                            "chat" => Some(Show::Chat),
                            "away" => Some(Show::Away),
                            "dnd" => Some(Show::Dnd),
                            "xa" => Some(Show::Xa),
                            other => {
                                return Err(parse_err(format!("unknown show '{}'", other)))
                            }
                        };
                    }
                    b"status" => status = Some(read_text(reader)?),
                    b"priority" => {
                        priority = read_text(reader)?.trim().parse().unwrap_or(0);
                    }
                    _ => skip_element(reader)?,
                },
                Ok(Event::Empty(_)) => {}
                Ok(Event::End(_)) | Ok(Event::Eof) => break,
                Err(e) => return Err(parse_err(e.to_string())),
                _ => {}
            }
        }
    }
    Ok(Stanza::Presence(Presence {
        from: head.from,
        to: head.to,
        kind,
        show,
        priority,
        status,
    }))
}

fn parse_iq(reader: &mut Reader<&[u8]>, head: Head, empty: bool) -> Result<Stanza, Error> {
    let kind = match head.kind.as_deref() {
        Some("get") => IqKind::Get,
        Some("set") => IqKind::Set,
        Some("result") => IqKind::Result,
        Some("error") => IqKind::Error,
        Some(other) => return Err(parse_err(format!("unknown iq type '{}'", other))),
        None => return Err(parse_err("iq without type")),
    };
    let mut payload = None;
    if !empty {
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    if payload.is_none() {
                        payload = Some(parse_iq_payload(reader, &e, false)?);
                    } else {
                        skip_element(reader)?;
                    }
                }
                Ok(Event::Empty(e)) => {
                    if payload.is_none() {
                        payload = Some(parse_iq_payload(reader, &e, true)?);
                    }
                }
                Ok(Event::End(_)) | Ok(Event::Eof) => break,
                Err(e) => return Err(parse_err(e.to_string())),
                _ => {}
            }
        }
    }
    Ok(Stanza::Iq(Iq {
        from: head.from,
        to: head.to,
        id: head.id,
        kind,
        payload,
    }))
}

fn element_ns(e: &quick_xml::events::BytesStart<'_>) -> String {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == b"xmlns" {
            return attr_string(&attr);
        }
    }
    String::new()
}

fn parse_iq_payload(
    reader: &mut Reader<&[u8]>,
    e: &quick_xml::events::BytesStart<'_>,
    empty: bool,
) -> Result<IqPayload, Error> {
    let ns = element_ns(e);
    let tag = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
    let mut items = Vec::new();
    if !empty {
        if ns == NS_ROSTER {
            loop {
                match reader.read_event() {
                    Ok(Event::Start(item)) => {
                        if item.name().local_name().as_ref() == b"item" {
                            items.push(parse_roster_item(reader, &item, false)?);
                        } else {
                            skip_element(reader)?;
                        }
                    }
                    Ok(Event::Empty(item)) => {
                        if item.name().local_name().as_ref() == b"item" {
                            items.push(parse_roster_item(reader, &item, true)?);
                        }
                    }
                    Ok(Event::End(_)) | Ok(Event::Eof) => break,
                    Err(e) => return Err(parse_err(e.to_string())),
                    _ => {}
                }
            }
        } else {
            skip_element(reader)?;
        }
    }
    Ok(IqPayload { ns, tag, items })
}

fn parse_roster_item(
    reader: &mut Reader<&[u8]>,
    e: &quick_xml::events::BytesStart<'_>,
    empty: bool,
) -> Result<RosterItem, Error> {
    let mut jid = None;
    let mut name = None;
    let mut subscription = ItemSubscription::None;
    let mut pending = false;
    let mut approved = false;
    for attr in e.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr_string(&attr);
        match key.as_str() {
            "jid" => jid = Jid::parse(&value),
            "name" => name = Some(value),
            "subscription" => {
                subscription = match value.as_str() {
                    "none" => ItemSubscription::None,
                    "to" => ItemSubscription::To,
                    "from" => ItemSubscription::From,
                    "both" => ItemSubscription::Both,
                    "remove" => ItemSubscription::Remove,
                    other => {
                        return Err(parse_err(format!("unknown subscription '{}'", other)))
                    }
                }
            }
            "ask" => pending = value == "subscribe",
            "approved" => approved = value == "true" || value == "1",
            _ => {}
        }
    }
    let mut groups = Vec::new();
    if !empty {
        loop {
            match reader.read_event() {
                Ok(Event::Start(g)) => {
                    if g.name().local_name().as_ref() == b"group" {
                        groups.push(read_text(reader)?);
                    } else {
                        skip_element(reader)?;
                    }
                }
                Ok(Event::Empty(_)) => {}
                Ok(Event::End(_)) | Ok(Event::Eof) => break,
                Err(e) => return Err(parse_err(e.to_string())),
                _ => {}
            }
        }
    }
    let jid = jid.ok_or_else(|| parse_err("roster item without jid"))?;
    Ok(RosterItem {
        jid,
        name,
        subscription,
        pending,
        approved,
        groups,
    })
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// Chat message carrying `body` to the given address.
pub fn message_stanza(to: &Jid, body: &str) -> String {
    format!(
        "<message to='{}' type='chat'><body>{}</body></message>",
        escape(&to.to_string()),
        escape(body)
    )
}

fn iq_head(id: Option<&str>, to: Option<&Jid>, kind: &str) -> String {
    let mut head = format!("<iq type='{}'", kind);
    if let Some(id) = id {
        head.push_str(&format!(" id='{}'", escape(id)));
    }
    if let Some(to) = to {
        head.push_str(&format!(" to='{}'", escape(&to.to_string())));
    }
    head
}

/// Empty `<iq type='result'/>` acknowledging the request.
pub fn iq_result_empty(id: Option<&str>, to: Option<&Jid>) -> String {
    format!("{}/>", iq_head(id, to, "result"))
}

/// Version query answer with the fixed name/version/os triple.
pub fn iq_version_result(
    id: Option<&str>,
    to: Option<&Jid>,
    name: &str,
    version: &str,
    os: &str,
) -> String {
    format!(
        "{}><query xmlns='{}'><name>{}</name><version>{}</version><os>{}</os></query></iq>",
        iq_head(id, to, "result"),
        NS_VERSION,
        escape(name),
        escape(version),
        escape(os)
    )
}

/// `<bad-request/>` stanza error reply.
pub fn iq_error_bad_request(id: Option<&str>, to: Option<&Jid>) -> String {
    format!(
        "{}><error type='modify'><bad-request xmlns='{}'/></error></iq>",
        iq_head(id, to, "error"),
        NS_STANZAS
    )
}

/// `<service-unavailable/>` stanza error reply for unhandled namespaces.
pub fn iq_error_service_unavailable(id: Option<&str>, to: Option<&Jid>) -> String {
    format!(
        "{}><error type='cancel'><service-unavailable xmlns='{}'/></error></iq>",
        iq_head(id, to, "error"),
        NS_STANZAS
    )
}
