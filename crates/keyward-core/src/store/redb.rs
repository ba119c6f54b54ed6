//! Redb-backed durable storage implementation.
//!
//! One table per top-level bucket. Nested buckets are flattened into
//! composite keys: path segments joined by the ASCII unit separator, so a
//! prefix range scan over `room\x1F` visits exactly that room's sub-bucket.
//! Values are raw: UTF-8 strings, one byte for flags, eight big-endian bytes
//! for timestamps.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Arc,
};

use keyward_proto::{
    Algorithm, Curve25519Key, DeviceId, Ed25519Key, Membership, RoomId, SessionId, UserId,
};
use redb::{Database, ReadableTable, TableDefinition};

use super::{
    AccountRecord, DeviceRecord, Storage, StorageError, StoredDevice, StoredOwnDevice, StoredRoom,
    StoredState, StoredUser, UserRecord,
};
use crate::index::{SessionPointers, Triplet};

/// Table: crypto_me
/// Key: user / device / field, or user / device / megolm_out / room
const CRYPTO_ME: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crypto_me");

/// Table: crypto_users
/// Key: user / field, or user / devices / device / ...
const CRYPTO_USERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crypto_users");

/// Table: crypto_sessions_id
/// Key: room / user / device key / (olm_session_id | megolm_session_id)
const CRYPTO_SESSIONS_ID: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("crypto_sessions_id");

/// Table: crypto_rooms
/// Key: room / encryption_alg, or room / members / user
const CRYPTO_ROOMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("crypto_rooms");

/// Separator between key path segments.
const SEPARATOR: u8 = 0x1F;

type Table = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc). The
/// database file is released when the last clone is dropped.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates the four bucket tables if they don't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            for table in [CRYPTO_ME, CRYPTO_USERS, CRYPTO_SESSIONS_ID, CRYPTO_ROOMS] {
                let _ = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Write every `(path, value)` pair into `table` in one transaction.
    fn put_all(&self, table: Table, entries: &[(&[&str], &[u8])]) -> Result<(), StorageError> {
        let keys =
            entries.iter().map(|(path, _)| encode_path(path)).collect::<Result<Vec<_>, _>>()?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;
            for (key, (_, value)) in keys.iter().zip(entries) {
                table
                    .insert(key.as_slice(), *value)
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn put(&self, table: Table, path: &[&str], value: &[u8]) -> Result<(), StorageError> {
        self.put_all(table, &[(path, value)])
    }

    /// Read every entry of `table` whose key starts with `prefix`, decoded
    /// into path segments with the prefix stripped.
    fn scan(&self, table: Table, prefix: &[&str]) -> Result<Vec<Entry>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(table).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut entries = Vec::new();
        let mut push = |key: &[u8], value: &[u8]| -> Result<(), StorageError> {
            let mut path = decode_path(key)?;
            path.drain(..prefix.len());
            entries.push(Entry { path, value: value.to_vec() });
            Ok(())
        };

        if prefix.is_empty() {
            for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
                let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                push(key.value(), value.value())?;
            }
        } else {
            let (start, end) = prefix_bounds(prefix)?;
            let results = table
                .range(start.as_slice()..end.as_slice())
                .map_err(|e| StorageError::Io(e.to_string()))?;
            for result in results {
                let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                push(key.value(), value.value())?;
            }
        }

        Ok(entries)
    }

    fn load_own(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<StoredOwnDevice>, StorageError> {
        let mut ed25519 = None;
        let mut curve25519 = None;
        let mut pickle = None;
        let mut keys_published = false;
        let mut sync_token = None;
        let mut megolm_out = BTreeMap::new();

        for entry in self.scan(CRYPTO_ME, &[user_id.as_str(), device_id.as_str()])? {
            match entry.segments().as_slice() {
                ["ed25519"] => ed25519 = Some(Ed25519Key::new(entry.string()?)),
                ["curve25519"] => curve25519 = Some(Curve25519Key::new(entry.string()?)),
                ["account"] => pickle = Some(entry.string()?),
                ["keys_published"] => keys_published = entry.flag()?,
                ["next_batch"] => sync_token = Some(entry.string()?),
                ["megolm_out", room] => {
                    megolm_out.insert(RoomId::from(*room), entry.string()?);
                },
                _ => entry.skip(),
            }
        }

        let (Some(ed25519), Some(curve25519), Some(pickle)) = (ed25519, curve25519, pickle) else {
            return Ok(None);
        };

        Ok(Some(StoredOwnDevice {
            account: AccountRecord { ed25519, curve25519, pickle },
            keys_published,
            sync_token,
            megolm_out,
        }))
    }

    fn load_users(&self) -> Result<Vec<StoredUser>, StorageError> {
        let mut users: BTreeMap<UserId, (UserRecord, BTreeMap<DeviceId, PartialDevice>)> =
            BTreeMap::new();

        for entry in self.scan(CRYPTO_USERS, &[])? {
            let segments = entry.segments();
            let [user, rest @ ..] = segments.as_slice() else {
                entry.skip();
                continue;
            };
            let (record, devices) = users.entry(UserId::from(*user)).or_default();

            match rest {
                ["devices_tracking"] => record.tracking = entry.flag()?,
                ["devices_outdated"] => record.outdated = entry.flag()?,
                ["devices_last_update"] => record.last_update = entry.timestamp()?,
                ["devices", device, field @ ..] => {
                    let device = devices.entry(DeviceId::from(*device)).or_default();
                    match field {
                        ["ed25519"] => device.ed25519 = Some(Ed25519Key::new(entry.string()?)),
                        ["curve25519"] => {
                            device.curve25519 = Some(Curve25519Key::new(entry.string()?));
                        },
                        ["olm", session] => {
                            device.olm.insert(SessionId::from(*session), entry.string()?);
                        },
                        ["megolm_in", session] => {
                            device.megolm.insert(SessionId::from(*session), entry.string()?);
                        },
                        ["shared_megolm", session] => {
                            device.shared.insert(SessionId::from(*session));
                        },
                        _ => entry.skip(),
                    }
                },
                _ => entry.skip(),
            }
        }

        Ok(users
            .into_iter()
            .map(|(user_id, (record, devices))| {
                let devices = devices
                    .into_iter()
                    .filter_map(|(device_id, partial)| partial.finish(&user_id, device_id))
                    .collect();
                StoredUser { user_id, record, devices }
            })
            .collect())
    }

    fn load_session_index(&self) -> Result<BTreeMap<Triplet, SessionPointers>, StorageError> {
        let mut index: BTreeMap<Triplet, SessionPointers> = BTreeMap::new();

        for entry in self.scan(CRYPTO_SESSIONS_ID, &[])? {
            let segments = entry.segments();
            let [room, user, key, field] = segments.as_slice() else {
                entry.skip();
                continue;
            };
            let triplet = Triplet::new(RoomId::from(*room), UserId::from(*user), (*key).into());
            let session_id = SessionId::new(entry.string()?);
            match *field {
                "olm_session_id" => index.entry(triplet).or_default().olm = Some(session_id),
                "megolm_session_id" => index.entry(triplet).or_default().megolm = Some(session_id),
                _ => entry.skip(),
            }
        }

        Ok(index)
    }

    fn load_rooms(&self) -> Result<BTreeMap<RoomId, StoredRoom>, StorageError> {
        let mut rooms: BTreeMap<RoomId, StoredRoom> = BTreeMap::new();

        for entry in self.scan(CRYPTO_ROOMS, &[])? {
            match entry.segments().as_slice() {
                [room, "encryption_alg"] => {
                    let algorithm = entry.string()?.parse::<Algorithm>().map_err(|e| {
                        StorageError::Corrupt { path: entry.display(), reason: e.to_string() }
                    })?;
                    rooms.entry(RoomId::from(*room)).or_default().algorithm = algorithm;
                },
                [room, "members", user] => {
                    let membership = entry.string()?.parse::<Membership>().map_err(|e| {
                        StorageError::Corrupt { path: entry.display(), reason: e.to_string() }
                    })?;
                    rooms
                        .entry(RoomId::from(*room))
                        .or_default()
                        .members
                        .insert(UserId::from(*user), membership);
                },
                _ => entry.skip(),
            }
        }

        Ok(rooms)
    }
}

impl Storage for RedbStorage {
    fn store_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        account: &AccountRecord,
    ) -> Result<(), StorageError> {
        let (user, device) = (user_id.as_str(), device_id.as_str());
        self.put_all(
            CRYPTO_ME,
            &[
                (&[user, device, "ed25519"], account.ed25519.as_str().as_bytes()),
                (&[user, device, "curve25519"], account.curve25519.as_str().as_bytes()),
                (&[user, device, "account"], account.pickle.as_bytes()),
            ],
        )
    }

    fn mark_keys_published(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StorageError> {
        self.put(CRYPTO_ME, &[user_id.as_str(), device_id.as_str(), "keys_published"], &[1])
    }

    fn store_sync_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        token: &str,
    ) -> Result<(), StorageError> {
        self.put(CRYPTO_ME, &[user_id.as_str(), device_id.as_str(), "next_batch"], token.as_bytes())
    }

    fn store_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_ME,
            &[user_id.as_str(), device_id.as_str(), "megolm_out", room_id.as_str()],
            pickle.as_bytes(),
        )
    }

    fn remove_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<(), StorageError> {
        let key =
            encode_path(&[user_id.as_str(), device_id.as_str(), "megolm_out", room_id.as_str()])?;

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let mut table = txn.open_table(CRYPTO_ME).map_err(|e| StorageError::Io(e.to_string()))?;
            table.remove(key.as_slice()).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn store_user(&self, user_id: &UserId, record: &UserRecord) -> Result<(), StorageError> {
        let user = user_id.as_str();
        self.put_all(
            CRYPTO_USERS,
            &[
                (&[user, "devices_tracking"], &[u8::from(record.tracking)]),
                (&[user, "devices_outdated"], &[u8::from(record.outdated)]),
                (&[user, "devices_last_update"], &record.last_update.to_be_bytes()),
            ],
        )
    }

    fn store_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: &DeviceRecord,
    ) -> Result<(), StorageError> {
        let (user, device) = (user_id.as_str(), device_id.as_str());
        self.put_all(
            CRYPTO_USERS,
            &[
                (&[user, "devices", device, "ed25519"], keys.ed25519.as_str().as_bytes()),
                (&[user, "devices", device, "curve25519"], keys.curve25519.as_str().as_bytes()),
            ],
        )
    }

    fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_USERS,
            &[user_id.as_str(), "devices", device_id.as_str(), "olm", session_id.as_str()],
            pickle.as_bytes(),
        )
    }

    fn store_megolm_in(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_USERS,
            &[user_id.as_str(), "devices", device_id.as_str(), "megolm_in", session_id.as_str()],
            pickle.as_bytes(),
        )
    }

    fn mark_megolm_shared(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        let (user, device) = (user_id.as_str(), device_id.as_str());
        let session = session_id.as_str();
        self.put(CRYPTO_USERS, &[user, "devices", device, "shared_megolm", session], &[1])
    }

    fn store_olm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_SESSIONS_ID,
            &[
                triplet.room_id.as_str(),
                triplet.user_id.as_str(),
                triplet.device_key.as_str(),
                "olm_session_id",
            ],
            session_id.as_str().as_bytes(),
        )
    }

    fn store_megolm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_SESSIONS_ID,
            &[
                triplet.room_id.as_str(),
                triplet.user_id.as_str(),
                triplet.device_key.as_str(),
                "megolm_session_id",
            ],
            session_id.as_str().as_bytes(),
        )
    }

    fn store_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<(), StorageError> {
        self.put(CRYPTO_ROOMS, &[room_id.as_str(), "encryption_alg"], algorithm.as_str().as_bytes())
    }

    fn store_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<(), StorageError> {
        self.put(
            CRYPTO_ROOMS,
            &[room_id.as_str(), "members", user_id.as_str()],
            membership.as_str().as_bytes(),
        )
    }

    fn load(&self, user_id: &UserId, device_id: &DeviceId) -> Result<StoredState, StorageError> {
        Ok(StoredState {
            own: self.load_own(user_id, device_id)?,
            users: self.load_users()?,
            session_index: self.load_session_index()?,
            rooms: self.load_rooms()?,
        })
    }
}

/// A decoded table entry.
struct Entry {
    path: Vec<String>,
    value: Vec<u8>,
}

impl Entry {
    fn segments(&self) -> Vec<&str> {
        self.path.iter().map(String::as_str).collect()
    }

    fn display(&self) -> String {
        self.path.join("/")
    }

    fn string(&self) -> Result<String, StorageError> {
        String::from_utf8(self.value.clone()).map_err(|e| StorageError::Corrupt {
            path: self.display(),
            reason: e.to_string(),
        })
    }

    fn flag(&self) -> Result<bool, StorageError> {
        match self.value.as_slice() {
            [byte] => Ok(*byte != 0),
            other => Err(StorageError::Corrupt {
                path: self.display(),
                reason: format!("flag must be 1 byte, got {}", other.len()),
            }),
        }
    }

    fn timestamp(&self) -> Result<u64, StorageError> {
        let bytes: [u8; 8] =
            self.value.as_slice().try_into().map_err(|_| StorageError::Corrupt {
                path: self.display(),
                reason: format!("timestamp must be 8 bytes, got {}", self.value.len()),
            })?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn skip(&self) {
        tracing::warn!(path = %self.display(), "skipping unrecognised store entry");
    }
}

/// Device fields gathered while scanning, before both keys are known.
#[derive(Default)]
struct PartialDevice {
    ed25519: Option<Ed25519Key>,
    curve25519: Option<Curve25519Key>,
    olm: BTreeMap<SessionId, String>,
    megolm: BTreeMap<SessionId, String>,
    shared: BTreeSet<SessionId>,
}

impl PartialDevice {
    fn finish(self, user_id: &UserId, device_id: DeviceId) -> Option<StoredDevice> {
        let (Some(ed25519), Some(curve25519)) = (self.ed25519, self.curve25519) else {
            tracing::warn!(%user_id, %device_id, "stored device has no identity keys, dropping");
            return None;
        };
        Some(StoredDevice {
            device_id,
            keys: DeviceRecord { ed25519, curve25519 },
            olm_sessions: self.olm,
            megolm_sessions: self.megolm,
            shared_megolm: self.shared,
        })
    }
}

/// Join path segments into a table key.
fn encode_path(segments: &[&str]) -> Result<Vec<u8>, StorageError> {
    let mut key = Vec::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
    for (i, segment) in segments.iter().enumerate() {
        if segment.as_bytes().contains(&SEPARATOR) {
            return Err(StorageError::InvalidKey((*segment).to_string()));
        }
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.extend_from_slice(segment.as_bytes());
    }
    Ok(key)
}

/// Split a table key back into path segments.
fn decode_path(key: &[u8]) -> Result<Vec<String>, StorageError> {
    key.split(|b| *b == SEPARATOR)
        .map(|segment| {
            String::from_utf8(segment.to_vec()).map_err(|e| StorageError::Corrupt {
                path: String::from_utf8_lossy(key).into_owned(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Half-open key range covering every path below `prefix`.
fn prefix_bounds(prefix: &[&str]) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
    let mut start = encode_path(prefix)?;
    let mut end = start.clone();
    start.push(SEPARATOR);
    end.push(SEPARATOR + 1);
    Ok((start, end))
}
