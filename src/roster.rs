//! The authoritative contact table and roster reconciliation.
//!
//! Full fetches and single-item pushes both land in `apply_item`; the
//! sender check for pushes lives in `push_authorized` so the router can
//! reject forged pushes before anything touches the table.

use crate::contact::{Contact, Subscription};
use crate::jid::Jid;
use crate::stanza::{ItemSubscription, RosterItem};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Roster {
    contacts: HashMap<String, Contact>,
}

impl Roster {
    pub fn get(&self, bare: &str) -> Option<&Contact> {
        self.contacts.get(bare)
    }

    pub fn get_mut(&mut self, bare: &str) -> Option<&mut Contact> {
        self.contacts.get_mut(bare)
    }

    pub fn contains(&self, bare: &str) -> bool {
        self.contacts.contains_key(bare)
    }

    /// Whether the server's roster names `bare`. Placeholder records that
    /// `find_or_add` creates for strangers do not count.
    pub fn listed(&self, bare: &str) -> bool {
        self.contacts.get(bare).is_some_and(|c| c.listed())
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// Look up the contact for `bare`, creating it on first reference.
    pub fn find_or_add(&mut self, bare: &str) -> &mut Contact {
        self.contacts
            .entry(bare.to_string())
            .or_insert_with(|| Contact::new(bare))
    }

    /// Reconcile one roster item into the table. The updated contact
    /// replaces the old record in a single insert; fingerprint history and
    /// active sessions carry over untouched.
    ///
    /// Panics on a `remove` subscription: the setup/push layer filters
    /// removals before they get here, so seeing one means an upstream
    /// contract was broken.
    pub fn apply_item(&mut self, item: &RosterItem) -> &Contact {
        let subscription = match item.subscription {
            ItemSubscription::None => Subscription::None,
            ItemSubscription::To => Subscription::To,
            ItemSubscription::From => Subscription::From,
            ItemSubscription::Both => Subscription::Both,
            ItemSubscription::Remove => {
                panic!("roster item with subscription='remove' reached apply_item")
            }
        };
        let bare = item.jid.bare();
        let mut contact = self
            .contacts
            .remove(bare)
            .unwrap_or_else(|| Contact::new(bare));
        contact.listed = true;
        contact.name = match item.name.as_deref() {
            None | Some("") => None,
            Some(name) => Some(name.to_string()),
        };
        contact.groups = item.groups.clone();
        contact.subscription = subscription;
        contact.pre_approved = item.approved;
        contact.pending_out = item.pending;
        debug!(contact = %bare, subscription = subscription.label(), "roster item applied");
        self.contacts.insert(bare.to_string(), contact);
        &self.contacts[bare]
    }
}

/// Whether a roster push from `from`, addressed to `recipient`, may touch
/// the table. Pushes without an origin come over the trusted server
/// channel; anything else must originate from our own bare address, or a
/// third party could inject forged roster changes.
pub fn push_authorized(from: Option<&Jid>, recipient: Option<&Jid>) -> bool {
    match from {
        None => true,
        Some(from) => matches!(recipient, Some(to) if from.same_bare(to)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(jid: &str, sub: ItemSubscription) -> RosterItem {
        RosterItem {
            jid: Jid::parse(jid).unwrap(),
            name: None,
            subscription: sub,
            pending: false,
            approved: false,
            groups: Vec::new(),
        }
    }

    #[test]
    fn test_find_or_add_is_idempotent() {
        let mut roster = Roster::default();
        roster.find_or_add("alice@example.com");
        roster.find_or_add("alice@example.com");
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_apply_item_creates_and_updates() {
        let mut roster = Roster::default();
        let mut first = item("bob@example.com", ItemSubscription::To);
        first.name = Some("Bob".to_string());
        first.groups = vec!["work".to_string()];
        roster.apply_item(&first);

        let contact = roster.get("bob@example.com").unwrap();
        assert_eq!(contact.name.as_deref(), Some("Bob"));
        assert_eq!(contact.subscription, Subscription::To);
        assert_eq!(contact.groups, vec!["work"]);

        let mut second = item("bob@example.com", ItemSubscription::Both);
        second.pending = true;
        second.approved = true;
        roster.apply_item(&second);

        let contact = roster.get("bob@example.com").unwrap();
        assert_eq!(contact.subscription, Subscription::Both);
        assert!(contact.pending_out);
        assert!(contact.pre_approved);
        assert!(contact.name.is_none());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_only_applied_items_mark_contacts_listed() {
        let mut roster = Roster::default();
        roster.find_or_add("zed@example.org");
        assert!(roster.contains("zed@example.org"));
        assert!(!roster.listed("zed@example.org"));

        roster.apply_item(&item("bob@example.com", ItemSubscription::To));
        assert!(roster.listed("bob@example.com"));
        assert!(!roster.listed("nobody@example.org"));
    }

    #[test]
    fn test_apply_item_normalizes_empty_name() {
        let mut roster = Roster::default();
        let mut it = item("bob@example.com", ItemSubscription::None);
        it.name = Some(String::new());
        roster.apply_item(&it);
        assert!(roster.get("bob@example.com").unwrap().name.is_none());
    }

    #[test]
    fn test_apply_item_preserves_trust_state() {
        let mut roster = Roster::default();
        roster
            .find_or_add("bob@example.com")
            .find_or_add_fingerprint(b"key-a");
        roster
            .get_mut("bob@example.com")
            .unwrap()
            .verify_fingerprint(b"key-a");

        roster.apply_item(&item("bob@example.com", ItemSubscription::Both));
        let contact = roster.get("bob@example.com").unwrap();
        assert!(contact.has_verified_fingerprint());
    }

    #[test]
    #[should_panic(expected = "subscription='remove'")]
    fn test_apply_item_remove_is_a_contract_violation() {
        let mut roster = Roster::default();
        roster.apply_item(&item("bob@example.com", ItemSubscription::Remove));
    }

    #[test]
    fn test_push_authorization() {
        let me = Jid::parse("me@example.com/desk").unwrap();
        let me_bare = Jid::parse("me@example.com").unwrap();
        let attacker = Jid::parse("mallory@evil.example").unwrap();

        // Server push without an origin: trusted
        assert!(push_authorized(None, Some(&me)));
        assert!(push_authorized(None, None));
        // Push from our own bare address: accepted
        assert!(push_authorized(Some(&me_bare), Some(&me)));
        assert!(push_authorized(Some(&me), Some(&me_bare)));
        // Forged push: rejected
        assert!(!push_authorized(Some(&attacker), Some(&me)));
        // Origin present but no declared recipient: rejected
        assert!(!push_authorized(Some(&attacker), None));
    }
}
