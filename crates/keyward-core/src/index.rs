//! Session index: which session is current for a (room, user, device) triplet.
//!
//! A remote device may hold many pairwise and inbound group sessions. The
//! index names the one in use for each room. Setting a pointer replaces the
//! previous one, so there is never more than one live mapping per triplet.

use std::collections::BTreeMap;

use keyward_proto::{Curve25519Key, RoomId, SessionId, UserId};

/// Key of the session index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Triplet {
    /// Room (or send-to-device pseudo room)
    pub room_id: RoomId,
    /// Remote user
    pub user_id: UserId,
    /// Remote device agreement key
    pub device_key: Curve25519Key,
}

impl Triplet {
    /// Build a triplet.
    pub fn new(room_id: RoomId, user_id: UserId, device_key: Curve25519Key) -> Self {
        Self { room_id, user_id, device_key }
    }
}

/// Current session ids for one triplet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPointers {
    /// Current pairwise session
    pub olm: Option<SessionId>,
    /// Current inbound group session
    pub megolm: Option<SessionId>,
}

/// In-memory session index.
#[derive(Debug, Clone, Default)]
pub struct SessionIndex {
    entries: BTreeMap<Triplet, SessionPointers>,
}

impl SessionIndex {
    /// Rebuild from persisted pointers.
    pub fn from_entries(entries: BTreeMap<Triplet, SessionPointers>) -> Self {
        Self { entries }
    }

    /// Current pairwise session for `triplet`.
    pub fn olm(&self, triplet: &Triplet) -> Option<&SessionId> {
        self.entries.get(triplet).and_then(|p| p.olm.as_ref())
    }

    /// Current inbound group session for `triplet`.
    pub fn megolm(&self, triplet: &Triplet) -> Option<&SessionId> {
        self.entries.get(triplet).and_then(|p| p.megolm.as_ref())
    }

    /// Replace the current pairwise session for `triplet`.
    pub fn set_olm(&mut self, triplet: Triplet, session_id: SessionId) {
        self.entries.entry(triplet).or_default().olm = Some(session_id);
    }

    /// Replace the current inbound group session for `triplet`.
    pub fn set_megolm(&mut self, triplet: Triplet, session_id: SessionId) {
        self.entries.entry(triplet).or_default().megolm = Some(session_id);
    }

    /// Number of triplets with at least one pointer.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no triplet has a pointer.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Triplet, &SessionPointers)> {
        self.entries.iter()
    }
}
