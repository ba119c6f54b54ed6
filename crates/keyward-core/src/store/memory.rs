#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use keyward_proto::{Algorithm, DeviceId, Membership, RoomId, SessionId, UserId};

use super::{
    AccountRecord, DeviceRecord, Storage, StorageError, StoredDevice, StoredOwnDevice, StoredRoom,
    StoredState, StoredUser, UserRecord,
};
use crate::index::{SessionPointers, Triplet};

/// In-memory storage implementation for testing and simulation
///
/// Mirrors the bucket hierarchy with nested maps. All state is wrapped in
/// Arc<Mutex<>> so clones share it. Uses `lock().expect()`, which panics if
/// the mutex is poisoned; acceptable for test code.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

#[derive(Default)]
struct MemoryStorageInner {
    /// Own devices keyed by (user, device)
    own: HashMap<(UserId, DeviceId), OwnEntry>,

    /// Remote users
    users: BTreeMap<UserId, UserEntry>,

    /// Session pointers
    session_index: BTreeMap<Triplet, SessionPointers>,

    /// Room metadata
    rooms: BTreeMap<RoomId, StoredRoom>,

    /// Successful write calls
    writes: usize,
}

#[derive(Default)]
struct OwnEntry {
    account: Option<AccountRecord>,
    keys_published: bool,
    sync_token: Option<String>,
    megolm_out: BTreeMap<RoomId, String>,
}

#[derive(Default)]
struct UserEntry {
    record: UserRecord,
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

#[derive(Default)]
struct DeviceEntry {
    keys: Option<DeviceRecord>,
    olm: BTreeMap<SessionId, String>,
    megolm: BTreeMap<SessionId, String>,
    shared: BTreeSet<SessionId>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write calls so far.
    ///
    /// Lets tests assert that an operation did or did not persist anything.
    #[allow(clippy::expect_used)]
    pub fn write_count(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").writes
    }

    #[allow(clippy::expect_used)]
    fn write<R>(&self, f: impl FnOnce(&mut MemoryStorageInner) -> R) -> R {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        inner.writes += 1;
        f(&mut *inner)
    }

    fn own<'a>(
        inner: &'a mut MemoryStorageInner,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> &'a mut OwnEntry {
        inner.own.entry((user_id.clone(), device_id.clone())).or_default()
    }

    fn device<'a>(
        inner: &'a mut MemoryStorageInner,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> &'a mut DeviceEntry {
        inner
            .users
            .entry(user_id.clone())
            .or_default()
            .devices
            .entry(device_id.clone())
            .or_default()
    }
}

impl Storage for MemoryStorage {
    fn store_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        account: &AccountRecord,
    ) -> Result<(), StorageError> {
        self.write(|inner| Self::own(inner, user_id, device_id).account = Some(account.clone()));
        Ok(())
    }

    fn mark_keys_published(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StorageError> {
        self.write(|inner| Self::own(inner, user_id, device_id).keys_published = true);
        Ok(())
    }

    fn store_sync_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        token: &str,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::own(inner, user_id, device_id).sync_token = Some(token.to_string());
        });
        Ok(())
    }

    fn store_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::own(inner, user_id, device_id)
                .megolm_out
                .insert(room_id.clone(), pickle.to_string());
        });
        Ok(())
    }

    fn remove_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::own(inner, user_id, device_id).megolm_out.remove(room_id);
        });
        Ok(())
    }

    fn store_user(&self, user_id: &UserId, record: &UserRecord) -> Result<(), StorageError> {
        self.write(|inner| inner.users.entry(user_id.clone()).or_default().record = *record);
        Ok(())
    }

    fn store_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: &DeviceRecord,
    ) -> Result<(), StorageError> {
        self.write(|inner| Self::device(inner, user_id, device_id).keys = Some(keys.clone()));
        Ok(())
    }

    fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::device(inner, user_id, device_id)
                .olm
                .insert(session_id.clone(), pickle.to_string());
        });
        Ok(())
    }

    fn store_megolm_in(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::device(inner, user_id, device_id)
                .megolm
                .insert(session_id.clone(), pickle.to_string());
        });
        Ok(())
    }

    fn mark_megolm_shared(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            Self::device(inner, user_id, device_id).shared.insert(session_id.clone());
        });
        Ok(())
    }

    fn store_olm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            inner.session_index.entry(triplet.clone()).or_default().olm = Some(session_id.clone());
        });
        Ok(())
    }

    fn store_megolm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            inner.session_index.entry(triplet.clone()).or_default().megolm =
                Some(session_id.clone());
        });
        Ok(())
    }

    fn store_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<(), StorageError> {
        self.write(|inner| inner.rooms.entry(room_id.clone()).or_default().algorithm = algorithm);
        Ok(())
    }

    fn store_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<(), StorageError> {
        self.write(|inner| {
            let room = inner.rooms.entry(room_id.clone()).or_default();
            room.members.insert(user_id.clone(), membership);
        });
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn load(&self, user_id: &UserId, device_id: &DeviceId) -> Result<StoredState, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let own = inner.own.get(&(user_id.clone(), device_id.clone())).and_then(|entry| {
            entry.account.clone().map(|account| StoredOwnDevice {
                account,
                keys_published: entry.keys_published,
                sync_token: entry.sync_token.clone(),
                megolm_out: entry.megolm_out.clone(),
            })
        });

        let users = inner
            .users
            .iter()
            .map(|(user_id, entry)| StoredUser {
                user_id: user_id.clone(),
                record: entry.record,
                devices: entry
                    .devices
                    .iter()
                    .filter_map(|(device_id, device)| {
                        device.keys.clone().map(|keys| StoredDevice {
                            device_id: device_id.clone(),
                            keys,
                            olm_sessions: device.olm.clone(),
                            megolm_sessions: device.megolm.clone(),
                            shared_megolm: device.shared.clone(),
                        })
                    })
                    .collect(),
            })
            .collect();

        Ok(StoredState {
            own,
            users,
            session_index: inner.session_index.clone(),
            rooms: inner.rooms.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use keyward_proto::{Curve25519Key, Ed25519Key};

    use super::*;

    #[test]
    fn clones_share_state() {
        let storage = MemoryStorage::new();
        let clone = storage.clone();

        clone.store_room_algorithm(&RoomId::from("!r:x"), Algorithm::Megolm).unwrap();

        let state = storage.load(&UserId::from("@a:x"), &DeviceId::from("A")).unwrap();
        assert_eq!(state.rooms[&RoomId::from("!r:x")].algorithm, Algorithm::Megolm);
        assert_eq!(storage.write_count(), 1);
    }

    #[test]
    fn device_without_keys_is_not_loaded() {
        let storage = MemoryStorage::new();
        let bob = UserId::from("@bob:x");

        storage.mark_megolm_shared(&bob, &DeviceId::from("B"), &SessionId::from("s")).unwrap();
        let state = storage.load(&UserId::from("@a:x"), &DeviceId::from("A")).unwrap();
        assert!(state.users[0].devices.is_empty());

        let keys =
            DeviceRecord { ed25519: Ed25519Key::from("e"), curve25519: Curve25519Key::from("c") };
        storage.store_device(&bob, &DeviceId::from("B"), &keys).unwrap();
        let state = storage.load(&UserId::from("@a:x"), &DeviceId::from("A")).unwrap();
        assert!(state.users[0].devices[0].shared_megolm.contains(&SessionId::from("s")));
    }
}
