//! Device directory: remote users, their devices and identity keys.
//!
//! Each user entry holds its devices under two indices, the agreement key
//! (primary, what ciphertexts are addressed by) and the device id (secondary,
//! what key claims and to-device sends are addressed by). Both indices are
//! updated together in [`UserDevices::insert`], so they never disagree.
//!
//! # Invariants
//!
//! - A device's identity keys never change once learned. A query that
//!   reports different keys for a known device id is ignored.
//! - User entries are created lazily and never deleted.
//! - Only devices with both keys and a valid self-signature are admitted.

use std::collections::{BTreeMap, BTreeSet};

use keyward_crypto::CipherSuite;
use keyward_proto::{Curve25519Key, DeviceId, DeviceKeys, Ed25519Key, SessionId, UserId};

use crate::{
    env::Environment,
    error::MachineError,
    machine::CryptoMachine,
    store::{DeviceRecord, Storage, StoredDevice, StoredUser, UserRecord},
    transport::Transport,
};

/// A remote device and the session material we hold for it.
pub struct RemoteDevice<C: CipherSuite> {
    device_id: DeviceId,
    ed25519: Ed25519Key,
    curve25519: Curve25519Key,
    pub(crate) olm_sessions: BTreeMap<SessionId, C::Session>,
    pub(crate) megolm_sessions: BTreeMap<SessionId, C::GroupIn>,
    pub(crate) shared_megolm: BTreeSet<SessionId>,
}

impl<C: CipherSuite> RemoteDevice<C> {
    /// A device with no sessions yet.
    pub fn new(device_id: DeviceId, ed25519: Ed25519Key, curve25519: Curve25519Key) -> Self {
        Self {
            device_id,
            ed25519,
            curve25519,
            olm_sessions: BTreeMap::new(),
            megolm_sessions: BTreeMap::new(),
            shared_megolm: BTreeSet::new(),
        }
    }

    fn restore(suite: &C, stored: StoredDevice) -> Result<Self, MachineError> {
        let mut device = Self::new(stored.device_id, stored.keys.ed25519, stored.keys.curve25519);
        for (session_id, pickle) in stored.olm_sessions {
            device.olm_sessions.insert(session_id, suite.unpickle_session(&pickle)?);
        }
        for (session_id, pickle) in stored.megolm_sessions {
            device.megolm_sessions.insert(session_id, suite.unpickle_group_in(&pickle)?);
        }
        device.shared_megolm = stored.shared_megolm;
        Ok(device)
    }

    /// Device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Signing key.
    pub fn ed25519(&self) -> &Ed25519Key {
        &self.ed25519
    }

    /// Agreement key.
    pub fn curve25519(&self) -> &Curve25519Key {
        &self.curve25519
    }

    /// Ids of the pairwise sessions held for this device.
    pub fn olm_session_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.olm_sessions.keys()
    }

    /// Ids of the inbound group sessions received from this device.
    pub fn megolm_session_ids(&self) -> impl Iterator<Item = &SessionId> {
        self.megolm_sessions.keys()
    }

    /// True if this device already received our outbound session `session_id`.
    pub fn has_received(&self, session_id: &SessionId) -> bool {
        self.shared_megolm.contains(session_id)
    }

    pub(crate) fn record(&self) -> DeviceRecord {
        DeviceRecord { ed25519: self.ed25519.clone(), curve25519: self.curve25519.clone() }
    }
}

/// Result of adding a device to a user entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceInsert {
    /// New device
    Added,
    /// Already known with the same keys
    Unchanged,
    /// Known device id or agreement key with different keys; not applied
    KeysChanged,
}

/// Devices and device-list state of one remote user.
pub struct UserDevices<C: CipherSuite> {
    user_id: UserId,
    record: UserRecord,
    devices: BTreeMap<Curve25519Key, RemoteDevice<C>>,
    by_id: BTreeMap<DeviceId, Curve25519Key>,
}

impl<C: CipherSuite> UserDevices<C> {
    /// An entry with no devices.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            record: UserRecord::default(),
            devices: BTreeMap::new(),
            by_id: BTreeMap::new(),
        }
    }

    fn restore(suite: &C, stored: StoredUser) -> Result<Self, MachineError> {
        let mut user = Self::new(stored.user_id);
        user.record = stored.record;
        for device in stored.devices {
            let device = RemoteDevice::restore(suite, device)?;
            if user.insert(device) == DeviceInsert::KeysChanged {
                tracing::warn!(user_id = %user.user_id, "Stored devices share a key, keeping one");
            }
        }
        Ok(user)
    }

    /// User id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Device-list scalars.
    pub fn record(&self) -> UserRecord {
        self.record
    }

    /// We share an encrypted room with this user.
    pub fn tracking(&self) -> bool {
        self.record.tracking
    }

    /// The device list must be re-queried before next use.
    pub fn outdated(&self) -> bool {
        self.record.outdated
    }

    /// Unix seconds of the last successful refresh.
    pub fn last_update(&self) -> u64 {
        self.record.last_update
    }

    /// Device by agreement key.
    pub fn device(&self, key: &Curve25519Key) -> Option<&RemoteDevice<C>> {
        self.devices.get(key)
    }

    pub(crate) fn device_mut(&mut self, key: &Curve25519Key) -> Option<&mut RemoteDevice<C>> {
        self.devices.get_mut(key)
    }

    /// Device by id.
    pub fn device_by_id(&self, device_id: &DeviceId) -> Option<&RemoteDevice<C>> {
        self.by_id.get(device_id).and_then(|key| self.devices.get(key))
    }

    /// All devices in agreement-key order.
    pub fn devices(&self) -> impl Iterator<Item = &RemoteDevice<C>> {
        self.devices.values()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if no device is known.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Add a device, keeping both indices in step.
    pub fn insert(&mut self, device: RemoteDevice<C>) -> DeviceInsert {
        match (self.by_id.get(&device.device_id), self.devices.get(&device.curve25519)) {
            (None, None) => {
                self.by_id.insert(device.device_id.clone(), device.curve25519.clone());
                self.devices.insert(device.curve25519.clone(), device);
                DeviceInsert::Added
            },
            (Some(key), Some(known))
                if *key == device.curve25519
                    && known.device_id == device.device_id
                    && known.ed25519 == device.ed25519 =>
            {
                DeviceInsert::Unchanged
            },
            _ => DeviceInsert::KeysChanged,
        }
    }

    pub(crate) fn set_record(&mut self, record: UserRecord) {
        self.record = record;
    }
}

/// All known remote users.
pub struct DeviceDirectory<C: CipherSuite> {
    users: BTreeMap<UserId, UserDevices<C>>,
}

impl<C: CipherSuite> Default for DeviceDirectory<C> {
    fn default() -> Self {
        Self { users: BTreeMap::new() }
    }
}

impl<C: CipherSuite> DeviceDirectory<C> {
    pub(crate) fn restore(suite: &C, users: Vec<StoredUser>) -> Result<Self, MachineError> {
        let mut directory = Self::default();
        for stored in users {
            let user = UserDevices::restore(suite, stored)?;
            directory.users.insert(user.user_id.clone(), user);
        }
        Ok(directory)
    }

    /// Entry of `user_id`, if known.
    pub fn user(&self, user_id: &UserId) -> Option<&UserDevices<C>> {
        self.users.get(user_id)
    }

    pub(crate) fn user_mut(&mut self, user_id: &UserId) -> Option<&mut UserDevices<C>> {
        self.users.get_mut(user_id)
    }

    /// Entry of `user_id`, created empty if absent.
    pub(crate) fn entry(&mut self, user_id: &UserId) -> &mut UserDevices<C> {
        self.users.entry(user_id.clone()).or_insert_with(|| UserDevices::new(user_id.clone()))
    }

    /// Device of `user_id` with agreement key `key`. Never queries the server.
    pub fn lookup(&self, user_id: &UserId, key: &Curve25519Key) -> Option<&RemoteDevice<C>> {
        self.users.get(user_id).and_then(|user| user.device(key))
    }

    pub(crate) fn lookup_mut(
        &mut self,
        user_id: &UserId,
        key: &Curve25519Key,
    ) -> Option<&mut RemoteDevice<C>> {
        self.users.get_mut(user_id).and_then(|user| user.device_mut(key))
    }

    /// All users in id order.
    pub fn users(&self) -> impl Iterator<Item = &UserDevices<C>> {
        self.users.values()
    }

    /// Number of known users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True if no user is known.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Identity keys of a queried bundle, if complete and consistent.
fn bundle_keys(
    user_id: &UserId,
    device_id: &DeviceId,
    bundle: &DeviceKeys,
) -> Option<(Ed25519Key, Curve25519Key)> {
    if bundle.user_id != *user_id || bundle.device_id != *device_id {
        tracing::warn!(%user_id, %device_id, "Device bundle names another device, skipping");
        return None;
    }
    let (Some(ed25519), Some(curve25519)) = (bundle.ed25519(), bundle.curve25519()) else {
        tracing::warn!(%user_id, %device_id, "Device is missing an identity key, skipping");
        return None;
    };
    Some((ed25519, curve25519))
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Cached entry of `user_id`, refreshed first if new, outdated or no
    /// longer tracked.
    ///
    /// The entry is persisted as tracked and outdated before the query and
    /// only a successful refresh clears `outdated`, so a failed query is
    /// retried on the next call.
    pub async fn get_or_create_user(
        &mut self,
        user_id: &UserId,
    ) -> Result<&UserDevices<C>, MachineError> {
        let known = self.directory.user(user_id).map(UserDevices::record);
        match known {
            Some(UserRecord { tracking: true, outdated: false, .. }) => {},
            Some(UserRecord { tracking: true, outdated: true, .. }) => {
                self.refresh_user(user_id).await?;
            },
            Some(record) => {
                let record = UserRecord { tracking: true, outdated: true, ..record };
                self.store.store_user(user_id, &record)?;
                self.directory.entry(user_id).set_record(record);
                tracing::debug!(%user_id, "Tracking user again");
                self.refresh_user(user_id).await?;
            },
            None => {
                let record = UserRecord { tracking: true, outdated: true, last_update: 0 };
                self.store.store_user(user_id, &record)?;
                self.directory.entry(user_id).set_record(record);
                tracing::debug!(%user_id, "Tracking new user");
                self.refresh_user(user_id).await?;
            },
        }
        Ok(self.directory.entry(user_id))
    }

    /// Query every device of `user_id` and admit the valid ones.
    ///
    /// Devices missing a key or carrying a bad self-signature are skipped
    /// with a warning. Our own device is never added.
    pub async fn refresh_user(&mut self, user_id: &UserId) -> Result<(), MachineError> {
        let response = self.transport.query_keys(std::slice::from_ref(user_id)).await?;
        let own_device = (self.identity.user_id() == user_id).then(|| self.identity.device_id());

        let user = self.directory.entry(user_id);
        let mut added = 0usize;
        for (device_id, bundle) in response.device_keys.get(user_id).into_iter().flatten() {
            if own_device == Some(device_id) {
                continue;
            }
            let Some((ed25519, curve25519)) = bundle_keys(user_id, device_id, bundle) else {
                continue;
            };
            let verified = match (bundle.self_signature(), bundle.signable()) {
                (Some(signature), Ok(signable)) => {
                    self.suite.verify_ed25519(&ed25519, &signable, signature).is_ok()
                },
                _ => false,
            };
            if !verified {
                tracing::warn!(%user_id, %device_id, "Device self-signature invalid, skipping");
                continue;
            }

            let device = RemoteDevice::new(device_id.clone(), ed25519, curve25519);
            let fresh = !user.by_id.contains_key(device_id)
                && !user.devices.contains_key(device.curve25519());
            if fresh {
                self.store.store_device(user_id, device_id, &device.record())?;
            }
            match user.insert(device) {
                DeviceInsert::Added => added += 1,
                DeviceInsert::Unchanged => {},
                DeviceInsert::KeysChanged => {
                    tracing::warn!(%user_id, %device_id, "Device keys changed, ignoring update");
                },
            }
        }

        let record = UserRecord {
            outdated: false,
            last_update: self.env.wall_clock_secs(),
            ..user.record()
        };
        self.store.store_user(user_id, &record)?;
        user.set_record(record);

        tracing::debug!(%user_id, devices = user.len(), added, "Refreshed device list");
        Ok(())
    }

    /// Device of `user_id` with agreement key `key`. Never touches the
    /// network.
    pub fn lookup_device(
        &self,
        user_id: &UserId,
        key: &Curve25519Key,
    ) -> Result<&RemoteDevice<C>, MachineError> {
        self.directory.lookup(user_id, key).ok_or_else(|| MachineError::UnknownDevice {
            user_id: user_id.clone(),
            device_key: key.clone(),
        })
    }

    /// Make sure the device with agreement key `key` is in the directory,
    /// querying the server once if it is not.
    pub(crate) async fn ensure_device(
        &mut self,
        user_id: &UserId,
        key: &Curve25519Key,
    ) -> Result<(), MachineError> {
        if self.directory.lookup(user_id, key).is_some() {
            return Ok(());
        }
        if self.directory.user(user_id).is_some() {
            self.refresh_user(user_id).await?;
        } else {
            self.get_or_create_user(user_id).await?;
        }
        self.lookup_device(user_id, key).map(|_| ())
    }

    /// Apply device-list changes from a sync batch.
    ///
    /// Tracked users in `changed` are marked outdated and refreshed on next
    /// use; users in `left` stop being tracked.
    pub(crate) fn apply_device_lists(
        &mut self,
        changed: &[UserId],
        left: &[UserId],
    ) -> Result<(), MachineError> {
        for user_id in changed {
            let Some(user) = self.directory.user_mut(user_id) else {
                continue;
            };
            if !user.tracking() || user.outdated() {
                continue;
            }
            let record = UserRecord { outdated: true, ..user.record() };
            self.store.store_user(user_id, &record)?;
            user.set_record(record);
            tracing::debug!(%user_id, "Device list outdated");
        }
        for user_id in left {
            let Some(user) = self.directory.user_mut(user_id) else {
                continue;
            };
            if !user.tracking() {
                continue;
            }
            let record = UserRecord { tracking: false, ..user.record() };
            self.store.store_user(user_id, &record)?;
            user.set_record(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyward_crypto::VodozemacSuite;

    use super::*;

    fn device(id: &str, key: &str) -> RemoteDevice<VodozemacSuite> {
        RemoteDevice::new(DeviceId::from(id), Ed25519Key::from("ed"), Curve25519Key::from(key))
    }

    #[test]
    fn insert_keeps_both_indices() {
        let mut user = UserDevices::<VodozemacSuite>::new(UserId::from("@bob:x"));

        assert_eq!(user.insert(device("B1", "k1")), DeviceInsert::Added);
        assert_eq!(user.insert(device("B2", "k2")), DeviceInsert::Added);

        assert_eq!(user.device_by_id(&DeviceId::from("B2")).unwrap().curve25519().as_str(), "k2");
        assert_eq!(user.device(&Curve25519Key::from("k1")).unwrap().device_id().as_str(), "B1");
        assert_eq!(user.len(), 2);
    }

    #[test]
    fn known_device_keys_are_immutable() {
        let mut user = UserDevices::<VodozemacSuite>::new(UserId::from("@bob:x"));
        user.insert(device("B1", "k1"));

        assert_eq!(user.insert(device("B1", "k1")), DeviceInsert::Unchanged);
        assert_eq!(user.insert(device("B1", "other")), DeviceInsert::KeysChanged);
        assert_eq!(user.insert(device("B9", "k1")), DeviceInsert::KeysChanged);

        assert_eq!(user.len(), 1);
        assert!(user.device(&Curve25519Key::from("other")).is_none());
        assert!(user.device_by_id(&DeviceId::from("B9")).is_none());
    }

    #[test]
    fn lookup_never_creates_users() {
        let directory = DeviceDirectory::<VodozemacSuite>::default();
        assert!(directory.lookup(&UserId::from("@bob:x"), &Curve25519Key::from("k")).is_none());
        assert!(directory.is_empty());
    }
}
