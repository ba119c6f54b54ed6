//! The crypto machine: one explicit context object for all E2EE state.
//!
//! A [`CryptoMachine`] owns our identity, the device directory, the session
//! index, every room's encryption state and our outbound group sessions. It
//! is created from the store at startup ([`CryptoMachine::open`]) and every
//! mutation goes through `&mut self`, so there is exactly one writer.
//!
//! Operations are implemented next to the state they manage: device queries
//! in `directory`, pairwise sessions in `olm`, group sessions in `megolm`,
//! algorithm changes in `room`, and event routing in `pipeline`.
//!
//! # Sharing
//!
//! Long-running drivers (the sync loop, an application's send path) share a
//! machine through [`SharedMachine`], an async mutex. Holding the lock across
//! a network call is intentional: completions are applied in the order calls
//! were made.
//!
//! # Invariants
//!
//! - In-memory maps are rebuilt from the store alone; nothing in memory is
//!   required to survive a restart.
//! - A write that fails leaves the in-memory state as it was, except where an
//!   operation documents otherwise.

use std::{collections::BTreeMap, sync::Arc};

use keyward_crypto::{CipherSuite, OutboundGroupSession};
use keyward_proto::{DeviceId, RoomId, SessionId, UserId};
use tokio::sync::Mutex;

use crate::{
    config::MachineConfig,
    directory::DeviceDirectory,
    echo::EchoCache,
    env::Environment,
    error::MachineError,
    identity::OwnIdentity,
    index::SessionIndex,
    room::Room,
    store::Storage,
    transport::Transport,
};

/// A machine shared between tasks.
pub type SharedMachine<C, T, S, E> = Arc<Mutex<CryptoMachine<C, T, S, E>>>;

/// End-to-end encryption state for one of our devices.
///
/// Generic over the cipher suite `C`, the homeserver transport `T`, the
/// storage backend `S` and the environment `E`, so the same code runs
/// against production backends and the simulation harness.
pub struct CryptoMachine<C: CipherSuite, T: Transport, S: Storage, E: Environment> {
    pub(crate) suite: C,
    pub(crate) transport: Arc<T>,
    pub(crate) store: S,
    pub(crate) env: E,
    pub(crate) config: MachineConfig,
    pub(crate) identity: OwnIdentity<C::Account>,
    pub(crate) directory: DeviceDirectory<C>,
    pub(crate) index: SessionIndex,
    pub(crate) rooms: BTreeMap<RoomId, Room>,
    /// Our outbound group session per room
    pub(crate) outbound: BTreeMap<RoomId, C::GroupOut>,
    pub(crate) echoes: EchoCache,
    pub(crate) sync_token: Option<String>,
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Load the machine for `(user_id, device_id)` from `store`.
    ///
    /// On first start a fresh account is created and persisted. Publishing
    /// its keys is a separate network step, see
    /// [`publish_keys`](Self::publish_keys).
    pub fn open(
        store: S,
        suite: C,
        transport: T,
        env: E,
        config: MachineConfig,
        user_id: UserId,
        device_id: DeviceId,
    ) -> Result<Self, MachineError> {
        let state = store.load(&user_id, &device_id)?;

        let (identity, sync_token, outbound_pickles) = if let Some(own) = state.own {
            let account = suite.unpickle_account(&own.account.pickle)?;
            let identity = OwnIdentity::new(user_id, device_id, account, own.keys_published);
            if identity.keys().curve25519 != own.account.curve25519 {
                return Err(MachineError::violation("stored identity keys do not match account"));
            }
            (identity, own.sync_token, own.megolm_out)
        } else {
            let identity = OwnIdentity::new(user_id, device_id, suite.create_account(), false);
            let record = identity.record(&suite);
            store.store_account(identity.user_id(), identity.device_id(), &record)?;
            tracing::info!(
                user_id = %identity.user_id(),
                device_id = %identity.device_id(),
                curve25519 = %identity.keys().curve25519,
                "Created device identity"
            );
            (identity, None, BTreeMap::new())
        };

        let mut outbound = BTreeMap::new();
        for (room_id, pickle) in outbound_pickles {
            outbound.insert(room_id, suite.unpickle_group_out(&pickle)?);
        }

        let directory = DeviceDirectory::restore(&suite, state.users)?;
        let index = SessionIndex::from_entries(state.session_index);
        let rooms: BTreeMap<RoomId, Room> = state
            .rooms
            .into_iter()
            .map(|(room_id, stored)| (room_id.clone(), Room::restore(room_id, stored)))
            .collect();

        tracing::debug!(
            users = directory.len(),
            rooms = rooms.len(),
            outbound_sessions = outbound.len(),
            index_entries = index.len(),
            "Loaded crypto state"
        );

        Ok(Self {
            suite,
            transport: Arc::new(transport),
            store,
            env,
            echoes: EchoCache::new(config.echo_cache_capacity),
            config,
            identity,
            directory,
            index,
            rooms,
            outbound,
            sync_token,
        })
    }

    /// Wrap in an async mutex for sharing between tasks.
    pub fn into_shared(self) -> SharedMachine<C, T, S, E> {
        Arc::new(Mutex::new(self))
    }

    /// Our user id.
    pub fn user_id(&self) -> &UserId {
        self.identity.user_id()
    }

    /// Our device id.
    pub fn device_id(&self) -> &DeviceId {
        self.identity.device_id()
    }

    /// Our identity keys and publication state.
    pub fn identity(&self) -> &OwnIdentity<C::Account> {
        &self.identity
    }

    /// Known remote users and devices.
    pub fn directory(&self) -> &DeviceDirectory<C> {
        &self.directory
    }

    /// Current session pointers.
    pub fn session_index(&self) -> &SessionIndex {
        &self.index
    }

    /// Encryption state of a room, if we have seen it.
    pub fn room(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    /// All known rooms.
    pub fn rooms(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }

    /// Id of our current outbound group session in `room_id`.
    pub fn outbound_session_id(&self, room_id: &RoomId) -> Option<SessionId> {
        self.outbound.get(room_id).map(OutboundGroupSession::session_id)
    }

    /// Token of the last applied sync batch.
    pub fn sync_token(&self) -> Option<&str> {
        self.sync_token.as_deref()
    }

    /// Machine configuration.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Transport handle, shared with drivers that call it outside the lock.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Environment handle.
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Storage backend.
    pub fn store(&self) -> &S {
        &self.store
    }
}
