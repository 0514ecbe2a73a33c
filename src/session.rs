//! Per-device sessions and the availability state machine.
//!
//! Sessions live in an arena keyed by `SessionId`; contacts reference them
//! by id only. A session is created on the first stanza naming its full
//! address and carries the device's availability, priority, status text,
//! and the opaque encryption context for that device.

use crate::stanza::Show;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

/// Device availability, the six-state machine driven by presence stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    #[default]
    Offline,
    Online,
    Free,
    Away,
    DoNotDisturb,
    ExtendedAway,
}

impl Availability {
    /// Single-character code used in transition log lines.
    pub fn symbol(self) -> char {
        match self {
            Availability::Offline => '_',
            Availability::Online => 'o',
            Availability::Free => 'f',
            Availability::Away => 'a',
            Availability::DoNotDisturb => 'd',
            Availability::ExtendedAway => 'x',
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Availability::Offline => "offline",
            Availability::Online => "online",
            Availability::Free => "free for chat",
            Availability::Away => "away",
            Availability::DoNotDisturb => "do not disturb",
            Availability::ExtendedAway => "extended away",
        }
    }

    /// Availability announced by a type-less presence with the given
    /// `<show/>` detail.
    pub fn from_show(show: Option<Show>) -> Availability {
        match show {
            None => Availability::Online,
            Some(Show::Chat) => Availability::Free,
            Some(Show::Away) => Availability::Away,
            Some(Show::Dnd) => Availability::DoNotDisturb,
            Some(Show::Xa) => Availability::ExtendedAway,
        }
    }
}

#[derive(Debug)]
pub struct Session<C> {
    pub id: SessionId,
    bare: String,
    resource: String,
    pub availability: Availability,
    pub priority: i8,
    pub status: Option<String>,
    /// Opaque handshake state, created lazily on the first message that
    /// needs it and replaced wholesale after every engine call.
    pub encryption: Option<C>,
    /// Ephemeral session: drop it entirely once the device goes offline.
    pub dispose: bool,
}

impl<C> Session<C> {
    pub fn bare(&self) -> &str {
        &self.bare
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Apply an availability transition, returning `(old, new)`.
    pub fn transition(
        &mut self,
        to: Availability,
        priority: i8,
        status: Option<String>,
    ) -> (Availability, Availability) {
        let old = self.availability;
        self.availability = to;
        self.priority = priority;
        self.status = status;
        (old, to)
    }
}

/// Arena of all live sessions, indexed by (bare, resource).
#[derive(Debug)]
pub struct SessionStore<C> {
    sessions: HashMap<SessionId, Session<C>>,
    index: HashMap<(String, String), SessionId>,
    next_id: u64,
}

impl<C> Default for SessionStore<C> {
    fn default() -> Self {
        SessionStore {
            sessions: HashMap::new(),
            index: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<C> SessionStore<C> {
    pub fn find(&self, bare: &str, resource: &str) -> Option<SessionId> {
        self.index
            .get(&(bare.to_string(), resource.to_string()))
            .copied()
    }

    pub fn get(&self, id: SessionId) -> Option<&Session<C>> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<C>> {
        self.sessions.get_mut(&id)
    }

    /// Existing session for the full address, or a fresh one. `dispose`
    /// only applies at creation time.
    pub fn find_or_create(&mut self, bare: &str, resource: &str, dispose: bool) -> SessionId {
        if let Some(id) = self.find(bare, resource) {
            return id;
        }
        let id = SessionId(self.next_id);
        self.next_id += 1;
        self.sessions.insert(
            id,
            Session {
                id,
                bare: bare.to_string(),
                resource: resource.to_string(),
                availability: Availability::Offline,
                priority: 0,
                status: None,
                encryption: None,
                dispose,
            },
        );
        self.index
            .insert((bare.to_string(), resource.to_string()), id);
        id
    }

    /// Drop a session from the arena and the index. The caller is
    /// responsible for removing the id from the owning contact's set.
    pub fn remove(&mut self, id: SessionId) -> Option<Session<C>> {
        let session = self.sessions.remove(&id)?;
        self.index
            .remove(&(session.bare.clone(), session.resource.clone()));
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_exhaustive() {
        assert_eq!(Availability::from_show(None), Availability::Online);
        assert_eq!(Availability::from_show(Some(Show::Chat)), Availability::Free);
        assert_eq!(Availability::from_show(Some(Show::Away)), Availability::Away);
        assert_eq!(
            Availability::from_show(Some(Show::Dnd)),
            Availability::DoNotDisturb
        );
        assert_eq!(
            Availability::from_show(Some(Show::Xa)),
            Availability::ExtendedAway
        );
    }

    #[test]
    fn test_symbols_are_distinct() {
        let all = [
            Availability::Offline,
            Availability::Online,
            Availability::Free,
            Availability::Away,
            Availability::DoNotDisturb,
            Availability::ExtendedAway,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.symbol(), b.symbol());
            }
        }
    }

    #[test]
    fn test_find_or_create_is_idempotent_per_full_address() {
        let mut store: SessionStore<()> = SessionStore::default();
        let a = store.find_or_create("alice@example.com", "phone", false);
        let same = store.find_or_create("alice@example.com", "phone", true);
        let other = store.find_or_create("alice@example.com", "laptop", false);
        assert_eq!(a, same);
        assert_ne!(a, other);
        // dispose was fixed at creation
        assert!(!store.get(a).unwrap().dispose);
    }

    #[test]
    fn test_transition_updates_fields() {
        let mut store: SessionStore<()> = SessionStore::default();
        let id = store.find_or_create("alice@example.com", "phone", false);
        let session = store.get_mut(id).unwrap();
        let (old, new) = session.transition(Availability::Away, 5, Some("lunch".into()));
        assert_eq!(old, Availability::Offline);
        assert_eq!(new, Availability::Away);
        assert_eq!(session.priority, 5);
        assert_eq!(session.status.as_deref(), Some("lunch"));
    }

    #[test]
    fn test_remove_clears_index() {
        let mut store: SessionStore<()> = SessionStore::default();
        let id = store.find_or_create("alice@example.com", "phone", true);
        assert!(store.remove(id).is_some());
        assert!(store.find("alice@example.com", "phone").is_none());
        // A later stanza builds a brand new session
        let fresh = store.find_or_create("alice@example.com", "phone", true);
        assert_ne!(fresh, id);
    }
}
