//! Contacts and their trust records.
//!
//! One `Contact` per bare address, holding the roster-visible fields plus
//! the append-only fingerprint history and id-based membership of the
//! contact's active device sessions. Sessions themselves live in the
//! arena in `session.rs`; the contact only knows their ids, so there is no
//! ownership cycle between the two.

use crate::session::SessionId;
use std::collections::BTreeSet;

/// Mutual-presence-visibility state, mirroring RFC 6121.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn label(self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }
}

/// One observed peer key. Records are never deleted; `verified` only flips
/// false to true, and `session_count` counts established sessions that
/// used this key.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    pub data: Vec<u8>,
    pub verified: bool,
    pub session_count: u32,
}

#[derive(Debug, Clone)]
pub struct Contact {
    bare: String,
    /// Named by the server's roster. Only `Roster::apply_item` sets this;
    /// `find_or_add` creates unlisted placeholder records for strangers, so
    /// a stranger stays a stranger across any number of sessions.
    pub(crate) listed: bool,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub subscription: Subscription,
    /// Inbound subscription pre-approved (`approved` roster attribute).
    pub pre_approved: bool,
    /// Outbound subscription pending (`ask='subscribe'`).
    pub pending_out: bool,
    pub fingerprints: Vec<FingerprintRecord>,
    /// Ids of this contact's sessions; membership only, the arena owns.
    pub active: BTreeSet<SessionId>,
}

impl Contact {
    pub fn new(bare: impl Into<String>) -> Contact {
        Contact {
            bare: bare.into(),
            listed: false,
            name: None,
            groups: Vec::new(),
            subscription: Subscription::None,
            pre_approved: false,
            pending_out: false,
            fingerprints: Vec::new(),
            active: BTreeSet::new(),
        }
    }

    pub fn bare(&self) -> &str {
        &self.bare
    }

    /// Whether the server's roster names this contact, as opposed to a
    /// placeholder record created for a stranger's traffic.
    pub fn listed(&self) -> bool {
        self.listed
    }

    /// Any key of this contact already verified out of band?
    pub fn has_verified_fingerprint(&self) -> bool {
        self.fingerprints.iter().any(|fp| fp.verified)
    }

    /// Find the record for `data`, appending a fresh unverified one when
    /// this key has never been seen. Returns the record index; the list is
    /// append-only so indices stay stable.
    pub fn find_or_add_fingerprint(&mut self, data: &[u8]) -> usize {
        if let Some(idx) = self.fingerprints.iter().position(|fp| fp.data == data) {
            return idx;
        }
        self.fingerprints.push(FingerprintRecord {
            data: data.to_vec(),
            verified: false,
            session_count: 0,
        });
        self.fingerprints.len() - 1
    }

    /// Mark a known key as verified. No-op for unknown keys.
    pub fn verify_fingerprint(&mut self, data: &[u8]) -> bool {
        match self.fingerprints.iter_mut().find(|fp| fp.data == data) {
            Some(fp) => {
                fp.verified = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_or_add_fingerprint_appends_once() {
        let mut contact = Contact::new("alice@example.com");
        let a = contact.find_or_add_fingerprint(b"key-a");
        let again = contact.find_or_add_fingerprint(b"key-a");
        let b = contact.find_or_add_fingerprint(b"key-b");
        assert_eq!(a, again);
        assert_ne!(a, b);
        assert_eq!(contact.fingerprints.len(), 2);
        assert!(!contact.fingerprints[a].verified);
        assert_eq!(contact.fingerprints[a].session_count, 0);
    }

    #[test]
    fn test_verify_fingerprint_flips_only_known_keys() {
        let mut contact = Contact::new("alice@example.com");
        contact.find_or_add_fingerprint(b"key-a");
        assert!(contact.verify_fingerprint(b"key-a"));
        assert!(contact.has_verified_fingerprint());
        assert!(!contact.verify_fingerprint(b"key-unknown"));
        assert_eq!(contact.fingerprints.len(), 1);
    }

    #[test]
    fn test_new_contact_defaults() {
        let contact = Contact::new("alice@example.com");
        assert_eq!(contact.bare(), "alice@example.com");
        assert_eq!(contact.subscription, Subscription::None);
        assert!(contact.name.is_none());
        assert!(contact.active.is_empty());
        assert!(!contact.has_verified_fingerprint());
    }
}
