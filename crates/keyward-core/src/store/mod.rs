//! Persistent store for identity, device and session material.
//!
//! Trait-based abstraction over a four-bucket hierarchy. The trait is
//! synchronous: every call is one write transaction, and callers never hold a
//! transaction across an await point.
//!
//! # Layout
//!
//! ```text
//! crypto_me/<user>/<device>/
//!     ed25519, curve25519, account, keys_published, next_batch
//!     megolm_out/<room>                       outbound group session pickle
//! crypto_users/<user>/
//!     devices_tracking, devices_outdated, devices_last_update
//!     devices/<device>/
//!         ed25519, curve25519
//!         olm/<session>                       pairwise session pickle
//!         megolm_in/<session>                 inbound group session pickle
//!         shared_megolm/<session>             outbound session already sent
//! crypto_sessions_id/<room>/<user>/<device curve25519>/
//!     olm_session_id, megolm_session_id
//! crypto_rooms/<room>/
//!     encryption_alg
//!     members/<user>                          membership
//! ```
//!
//! # Invariants
//!
//! - No cross-call transactions. A crash between two related writes leaves
//!   each write either fully present or fully absent; callers re-derive or
//!   re-request on next use.
//! - [`Storage::load`] reconstructs every in-memory map in one pass. A
//!   missing bucket loads as empty.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::{BTreeMap, BTreeSet};

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use keyward_proto::{
    Algorithm, Curve25519Key, DeviceId, Ed25519Key, Membership, RoomId, SessionId, UserId,
};
pub use memory::MemoryStorage;

pub use self::redb::RedbStorage;
use crate::index::{SessionPointers, Triplet};

/// Own device identity as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    /// Signing key
    pub ed25519: Ed25519Key,
    /// Agreement key
    pub curve25519: Curve25519Key,
    /// Encrypted account pickle
    pub pickle: String,
}

/// Everything stored for our own device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOwnDevice {
    /// Identity and account
    pub account: AccountRecord,
    /// Whether signed device keys reached the server
    pub keys_published: bool,
    /// Last sync token applied
    pub sync_token: Option<String>,
    /// Outbound group session pickle per room
    pub megolm_out: BTreeMap<RoomId, String>,
}

/// Device-list scalars of a remote user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserRecord {
    /// We share an encrypted room with this user
    pub tracking: bool,
    /// Device list must be re-queried before next use
    pub outdated: bool,
    /// Unix seconds of the last successful refresh
    pub last_update: u64,
}

/// Identity keys of a remote device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Signing key
    pub ed25519: Ed25519Key,
    /// Agreement key
    pub curve25519: Curve25519Key,
}

/// A remote device with its session pickles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDevice {
    /// Device id
    pub device_id: DeviceId,
    /// Identity keys
    pub keys: DeviceRecord,
    /// Pairwise session pickles by session id
    pub olm_sessions: BTreeMap<SessionId, String>,
    /// Inbound group session pickles by session id
    pub megolm_sessions: BTreeMap<SessionId, String>,
    /// Our outbound group sessions this device has received
    pub shared_megolm: BTreeSet<SessionId>,
}

/// A remote user with all known devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    /// User id
    pub user_id: UserId,
    /// Device-list scalars
    pub record: UserRecord,
    /// Devices with complete key records
    pub devices: Vec<StoredDevice>,
}

/// Per-room metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRoom {
    /// Encryption algorithm
    pub algorithm: Algorithm,
    /// Last known membership per user
    pub members: BTreeMap<UserId, Membership>,
}

/// Result of [`Storage::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    /// Our own device, if an account was ever stored
    pub own: Option<StoredOwnDevice>,
    /// Remote users
    pub users: Vec<StoredUser>,
    /// Current session pointers per triplet
    pub session_index: BTreeMap<Triplet, SessionPointers>,
    /// Rooms by id
    pub rooms: BTreeMap<RoomId, StoredRoom>,
}

/// Storage abstraction for the crypto state.
///
/// Must be Clone (shared between the machine and tooling), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones see
/// the same data.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Store (or overwrite) our identity keys and account pickle.
    fn store_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        account: &AccountRecord,
    ) -> Result<(), StorageError>;

    /// Record that signed device keys were uploaded.
    fn mark_keys_published(&self, user_id: &UserId, device_id: &DeviceId)
    -> Result<(), StorageError>;

    /// Store the token of the last applied sync batch.
    fn store_sync_token(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        token: &str,
    ) -> Result<(), StorageError>;

    /// Store (or overwrite) the outbound group session of a room.
    fn store_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
        pickle: &str,
    ) -> Result<(), StorageError>;

    /// Forget the outbound group session of a room. Absent is not an error.
    fn remove_megolm_out(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &RoomId,
    ) -> Result<(), StorageError>;

    /// Store (or overwrite) device-list scalars of a remote user.
    fn store_user(&self, user_id: &UserId, record: &UserRecord) -> Result<(), StorageError>;

    /// Store (or overwrite) identity keys of a remote device.
    fn store_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        keys: &DeviceRecord,
    ) -> Result<(), StorageError>;

    /// Store (or overwrite) a pairwise session pickle.
    fn store_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError>;

    /// Store (or overwrite) an inbound group session pickle.
    fn store_megolm_in(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
        pickle: &str,
    ) -> Result<(), StorageError>;

    /// Record that a device received our outbound group session.
    fn mark_megolm_shared(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        session_id: &SessionId,
    ) -> Result<(), StorageError>;

    /// Point a triplet at its current pairwise session.
    fn store_olm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError>;

    /// Point a triplet at its current inbound group session.
    fn store_megolm_session_id(
        &self,
        triplet: &Triplet,
        session_id: &SessionId,
    ) -> Result<(), StorageError>;

    /// Store a room's encryption algorithm.
    fn store_room_algorithm(
        &self,
        room_id: &RoomId,
        algorithm: Algorithm,
    ) -> Result<(), StorageError>;

    /// Store a user's membership in a room.
    fn store_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<(), StorageError>;

    /// Load everything for our own device `(user_id, device_id)` plus all
    /// remote users, session pointers and rooms.
    fn load(&self, user_id: &UserId, device_id: &DeviceId) -> Result<StoredState, StorageError>;
}
