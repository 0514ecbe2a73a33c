//! JID (XMPP address) parsing and comparison.
//!
//! The core only needs the bare/full distinction: the bare form
//! (`local@domain`, case-normalized) keys the contact table, the resource
//! suffix keys per-device sessions. Stringprep subtleties are out of scope;
//! bare forms are lowercased, resources are kept verbatim (RFC 6120 treats
//! the resourcepart as case-sensitive).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    bare: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse a JID from its textual form. Accepts `local@domain`,
    /// `local@domain/resource`, and bare `domain` forms; rejects empty
    /// input and empty resourceparts.
    pub fn parse(input: &str) -> Option<Jid> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return None;
        }
        let (addr, resource) = match trimmed.split_once('/') {
            Some((addr, res)) => {
                if res.is_empty() {
                    return None;
                }
                (addr, Some(res.to_string()))
            }
            None => (trimmed, None),
        };
        if addr.is_empty() {
            return None;
        }
        Some(Jid {
            bare: addr.to_ascii_lowercase(),
            resource,
        })
    }

    /// The case-normalized `local@domain` form.
    pub fn bare(&self) -> &str {
        &self.bare
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Domain part of the address (everything after `@`, or the whole
    /// bare form for domain-only JIDs).
    pub fn domain(&self) -> &str {
        match self.bare.rsplit_once('@') {
            Some((_, domain)) => domain,
            None => &self.bare,
        }
    }

    /// True when both addresses share the same bare form, ignoring
    /// resources.
    pub fn same_bare(&self, other: &Jid) -> bool {
        self.bare == other.bare
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(res) => write!(f, "{}/{}", self.bare, res),
            None => write!(f, "{}", self.bare),
        }
    }
}
