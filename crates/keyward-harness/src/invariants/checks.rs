//! Standard invariant checks.
//!
//! Each check states a property that must hold after any sequence of
//! operations, including ones interrupted by storage or network failures.

use super::{ClientSnapshot, Invariant, SystemSnapshot, Violation};

/// Every session index pointer names a session held for the same device.
///
/// A pointer to a missing session would make the next encrypt or decrypt
/// for that triplet fail even though nothing was received out of order.
pub struct IndexResolves;

impl Invariant for IndexResolves {
    fn name(&self) -> &'static str {
        "IndexResolves"
    }

    fn check(&self, state: &SystemSnapshot, found: &mut Vec<Violation>) {
        for client in &state.clients {
            for (triplet, pointers) in &client.memory.index {
                let held = |session_id: &keyward_proto::SessionId| {
                    (triplet.user_id.clone(), triplet.device_key.clone(), session_id.clone())
                };
                if let Some(session_id) = &pointers.olm
                    && !client.memory.olm_sessions.contains(&held(session_id))
                {
                    let message = format!("olm pointer {session_id} for {triplet:?} dangles");
                    found.push(self.violation(client, message));
                }
                if let Some(session_id) = &pointers.megolm
                    && !client.memory.megolm_sessions.contains(&held(session_id))
                {
                    let message = format!("megolm pointer {session_id} for {triplet:?} dangles");
                    found.push(self.violation(client, message));
                }
            }
        }
    }
}

impl IndexResolves {
    fn violation(&self, client: &ClientSnapshot, message: String) -> Violation {
        Violation::new(self.name(), message).on(&client.user_id, &client.device_id)
    }
}

/// A room's algorithm never changes once it is encrypted.
///
/// Histories may start unencrypted and switch once; after that every
/// observation must repeat the same algorithm.
pub struct AlgorithmMonotonicity;

impl Invariant for AlgorithmMonotonicity {
    fn name(&self) -> &'static str {
        "AlgorithmMonotonicity"
    }

    fn check(&self, state: &SystemSnapshot, found: &mut Vec<Violation>) {
        for ((user_id, device_id, room_id), history) in &state.algorithm_history {
            let switched = history
                .windows(2)
                .find(|pair| pair[0].is_encrypted() && pair[1] != pair[0]);
            if let Some(pair) = switched {
                let message = format!("{room_id} switched from {} to {}", pair[0], pair[1]);
                found.push(Violation::new(self.name(), message).on(user_id, device_id));
            }
        }
    }
}

/// Nothing in memory is lost by a restart.
///
/// Room state, the session index and outbound sessions must equal what the
/// store loads. Sessions held in memory must all be persisted; the store may
/// hold extra sessions whose pointer write failed.
pub struct MemoryIsDurable;

impl Invariant for MemoryIsDurable {
    fn name(&self) -> &'static str {
        "MemoryIsDurable"
    }

    fn check(&self, state: &SystemSnapshot, found: &mut Vec<Violation>) {
        for client in &state.clients {
            let (memory, persisted) = (&client.memory, &client.persisted);
            let drift = [
                (memory.rooms != persisted.rooms, "room state differs from store"),
                (memory.index != persisted.index, "session index differs from store"),
                (
                    memory.outbound_rooms != persisted.outbound_rooms,
                    "outbound sessions differ from store",
                ),
                (
                    !memory.olm_sessions.is_subset(&persisted.olm_sessions),
                    "olm session held in memory only",
                ),
                (
                    !memory.megolm_sessions.is_subset(&persisted.megolm_sessions),
                    "megolm session held in memory only",
                ),
            ];
            found.extend(drift.into_iter().filter(|(broken, _)| *broken).map(|(_, what)| {
                Violation::new(self.name(), what).on(&client.user_id, &client.device_id)
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use keyward_core::{SessionPointers, Triplet};
    use keyward_proto::{Algorithm, Curve25519Key, DeviceId, RoomId, SessionId, UserId};

    use super::*;
    use crate::invariants::{RoomSnapshot, StateView};

    fn violations(invariant: &impl Invariant, snapshot: &SystemSnapshot) -> Vec<Violation> {
        let mut found = Vec::new();
        invariant.check(snapshot, &mut found);
        found
    }

    fn client() -> ClientSnapshot {
        ClientSnapshot {
            user_id: UserId::from("@alice:sim"),
            device_id: DeviceId::from("A"),
            memory: StateView::default(),
            persisted: StateView::default(),
            outbound: BTreeMap::new(),
        }
    }

    fn triplet() -> Triplet {
        Triplet::new(RoomId::from("!r:sim"), UserId::from("@bob:sim"), Curve25519Key::from("k"))
    }

    #[test]
    fn dangling_pointer_is_caught() {
        let mut client = client();
        let pointers = SessionPointers { olm: Some(SessionId::from("s1")), megolm: None };
        client.memory.index.insert(triplet(), pointers);

        let found = violations(&IndexResolves, &SystemSnapshot::single(client.clone()));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device, Some((UserId::from("@alice:sim"), DeviceId::from("A"))));

        let held = (UserId::from("@bob:sim"), Curve25519Key::from("k"), SessionId::from("s1"));
        client.memory.olm_sessions.insert(held);
        assert!(violations(&IndexResolves, &SystemSnapshot::single(client)).is_empty());
    }

    #[test]
    fn encrypted_room_may_not_switch() {
        let room = |algorithm| RoomSnapshot { algorithm, members: BTreeMap::new() };
        let mut first = client();
        first.memory.rooms.insert(RoomId::from("!r:sim"), room(Algorithm::None));
        let mut second = client();
        second.memory.rooms.insert(RoomId::from("!r:sim"), room(Algorithm::Megolm));
        let mut third = client();
        third.memory.rooms.insert(RoomId::from("!r:sim"), room(Algorithm::Olm));

        let mut snapshot = SystemSnapshot::single(first);
        snapshot.advance(vec![second]);
        assert!(violations(&AlgorithmMonotonicity, &snapshot).is_empty());

        snapshot.advance(vec![third]);
        assert_eq!(violations(&AlgorithmMonotonicity, &snapshot).len(), 1);
    }

    #[test]
    fn extra_persisted_session_is_allowed() {
        let mut client = client();
        let held = (UserId::from("@bob:sim"), Curve25519Key::from("k"), SessionId::from("s1"));
        client.persisted.olm_sessions.insert(held.clone());
        assert!(violations(&MemoryIsDurable, &SystemSnapshot::single(client.clone())).is_empty());

        client.persisted.olm_sessions.clear();
        client.memory.olm_sessions.insert(held);
        client.memory.outbound_rooms.insert(RoomId::from("!r:sim"));
        let found = violations(&MemoryIsDurable, &SystemSnapshot::single(client));
        let messages: Vec<_> = found.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(
            messages,
            ["outbound sessions differ from store", "olm session held in memory only"]
        );
    }
}
