//! Per-room encryption algorithm and membership.
//!
//! A room starts as plaintext and may move once to a concrete algorithm;
//! after that the algorithm is fixed. Membership is tracked per user so the
//! send path knows whose devices to encrypt for.
//!
//! # Invariants
//!
//! - The algorithm only ever moves from `None` to olm or megolm.
//! - Each user holds exactly one membership state per room.
//! - Every change is written to the store before the call returns.

use std::collections::BTreeMap;

use keyward_crypto::CipherSuite;
use keyward_proto::{
    Algorithm, EncryptionContent, Membership, ProtocolError, RoomId, UserId,
    event_type::ROOM_ENCRYPTION,
};

use crate::{
    env::Environment,
    error::MachineError,
    machine::CryptoMachine,
    store::{Storage, StoredRoom},
    transport::Transport,
};

/// Encryption state of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
    room_id: RoomId,
    algorithm: Algorithm,
    members: BTreeMap<UserId, Membership>,
}

impl Room {
    /// Plaintext room with no known members.
    pub fn new(room_id: RoomId) -> Self {
        Self { room_id, algorithm: Algorithm::None, members: BTreeMap::new() }
    }

    pub(crate) fn restore(room_id: RoomId, stored: StoredRoom) -> Self {
        Self { room_id, algorithm: stored.algorithm, members: stored.members }
    }

    /// Room id.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Algorithm in effect.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Membership of `user_id`, if we have seen one.
    pub fn membership(&self, user_id: &UserId) -> Option<Membership> {
        self.members.get(user_id).copied()
    }

    /// Users currently in `membership`.
    pub fn members(&self, membership: Membership) -> impl Iterator<Item = &UserId> {
        self.members.iter().filter(move |(_, m)| **m == membership).map(|(user_id, _)| user_id)
    }

    /// Joined users.
    pub fn joined(&self) -> impl Iterator<Item = &UserId> {
        self.members(Membership::Join)
    }
}

/// Decide an algorithm transition. `Ok(true)` means the room must change.
fn transition(
    room_id: &RoomId,
    current: Algorithm,
    requested: Algorithm,
) -> Result<bool, MachineError> {
    if current == requested || (!current.is_encrypted() && !requested.is_encrypted()) {
        return Ok(false);
    }
    if current.is_encrypted() {
        return Err(MachineError::AlgorithmConflict {
            room_id: room_id.clone(),
            current,
            requested,
        });
    }
    Ok(true)
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Enable encryption in `room_id` by sending an `m.room.encryption`
    /// state event.
    ///
    /// Asking for the algorithm already in effect succeeds without a network
    /// call. Asking for any other algorithm once one is set fails with
    /// [`AlgorithmConflict`](MachineError::AlgorithmConflict) and leaves the
    /// room unchanged. Local state only changes after the server accepted
    /// the event.
    pub async fn set_algorithm(
        &mut self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<(), MachineError> {
        let current = self.room_algorithm(room_id);
        if !transition(room_id, current, algorithm)? {
            return Ok(());
        }

        let content =
            serde_json::to_value(EncryptionContent::new(algorithm)).map_err(ProtocolError::from)?;
        let event_id =
            self.transport.send_state_event(room_id, ROOM_ENCRYPTION, "", &content).await?;

        self.store.store_room_algorithm(room_id, algorithm)?;
        self.room_entry(room_id).algorithm = algorithm;
        tracing::info!(%room_id, %algorithm, %event_id, "Enabled room encryption");
        Ok(())
    }

    /// Algorithm in effect for `room_id`; unknown rooms are plaintext.
    pub fn room_algorithm(&self, room_id: &RoomId) -> Algorithm {
        self.rooms.get(room_id).map_or(Algorithm::None, Room::algorithm)
    }

    /// Apply an `m.room.encryption` event received from the server.
    ///
    /// Returns whether the algorithm changed.
    pub(crate) fn apply_room_encryption(
        &mut self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<bool, MachineError> {
        if !transition(room_id, self.room_algorithm(room_id), algorithm)? {
            return Ok(false);
        }
        self.store.store_room_algorithm(room_id, algorithm)?;
        self.room_entry(room_id).algorithm = algorithm;
        tracing::info!(%room_id, %algorithm, "Room encryption enabled by state event");
        Ok(true)
    }

    /// Record `user_id`'s membership in `room_id`, replacing any previous
    /// state.
    pub(crate) fn apply_membership(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<Option<Membership>, MachineError> {
        self.store.store_membership(room_id, user_id, membership)?;
        let previous = self.room_entry(room_id).members.insert(user_id.clone(), membership);
        if previous != Some(membership) {
            tracing::debug!(%room_id, %user_id, %membership, "Membership changed");
        }
        Ok(previous)
    }

    /// Joined members of `room_id`, in a stable order.
    pub(crate) fn joined_members(&self, room_id: &RoomId) -> Vec<UserId> {
        self.rooms.get(room_id).map(|room| room.joined().cloned().collect()).unwrap_or_default()
    }

    fn room_entry(&mut self, room_id: &RoomId) -> &mut Room {
        self.rooms.entry(room_id.clone()).or_insert_with(|| Room::new(room_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::from("!r:x")
    }

    #[test]
    fn plaintext_room_may_pick_an_algorithm_once() {
        assert!(transition(&room(), Algorithm::None, Algorithm::Megolm).unwrap());
        assert!(transition(&room(), Algorithm::None, Algorithm::Olm).unwrap());
        assert!(!transition(&room(), Algorithm::None, Algorithm::None).unwrap());
    }

    #[test]
    fn same_algorithm_is_a_no_op() {
        assert!(!transition(&room(), Algorithm::Megolm, Algorithm::Megolm).unwrap());
        assert!(!transition(&room(), Algorithm::Olm, Algorithm::Olm).unwrap());
    }

    #[test]
    fn encrypted_room_never_changes() {
        for (current, requested) in [
            (Algorithm::Megolm, Algorithm::Olm),
            (Algorithm::Olm, Algorithm::Megolm),
            (Algorithm::Megolm, Algorithm::None),
        ] {
            let err = transition(&room(), current, requested).unwrap_err();
            assert_eq!(
                err,
                MachineError::AlgorithmConflict { room_id: room(), current, requested }
            );
        }
    }

    #[test]
    fn members_filter_by_state() {
        let mut stored = StoredRoom::default();
        stored.members.insert(UserId::from("@a:x"), Membership::Join);
        stored.members.insert(UserId::from("@b:x"), Membership::Invite);
        stored.members.insert(UserId::from("@c:x"), Membership::Join);
        let room = Room::restore(room(), stored);

        let joined: Vec<_> = room.joined().map(UserId::as_str).collect();
        assert_eq!(joined, ["@a:x", "@c:x"]);
        assert_eq!(room.membership(&UserId::from("@b:x")), Some(Membership::Invite));
        assert_eq!(room.membership(&UserId::from("@d:x")), None);
    }
}
