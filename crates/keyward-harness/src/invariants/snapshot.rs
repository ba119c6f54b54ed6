//! Observable state snapshots for invariant checking.
//!
//! A snapshot holds one client's in-memory state next to what its store
//! would load after a restart. Invariants compare the two views rather than
//! poking at live machines, so every check sees one consistent moment.

use std::collections::{BTreeMap, BTreeSet};

use keyward_core::{
    CryptoMachine, Environment, SessionPointers, Transport, Triplet,
    store::{Storage, StorageError, StoredState},
};
use keyward_crypto::CipherSuite;
use keyward_proto::{Algorithm, Curve25519Key, DeviceId, Membership, RoomId, SessionId, UserId};

/// A session held for a remote device: (owner, device key, session id).
pub type SessionRef = (UserId, Curve25519Key, SessionId);

/// Encryption state of one room.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomSnapshot {
    /// Algorithm in effect
    pub algorithm: Algorithm,
    /// Membership of every known user
    pub members: BTreeMap<UserId, Membership>,
}

/// Session and room state as seen from one side (memory or store).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateView {
    /// Rooms by id
    pub rooms: BTreeMap<RoomId, RoomSnapshot>,
    /// Session index entries
    pub index: BTreeMap<Triplet, SessionPointers>,
    /// Pairwise sessions
    pub olm_sessions: BTreeSet<SessionRef>,
    /// Inbound group sessions
    pub megolm_sessions: BTreeSet<SessionRef>,
    /// Rooms with an outbound group session
    pub outbound_rooms: BTreeSet<RoomId>,
}

impl StateView {
    /// View of what [`Storage::load`] returned.
    pub fn from_stored(state: &StoredState) -> Self {
        let mut view = Self {
            rooms: state
                .rooms
                .iter()
                .map(|(room_id, room)| {
                    let snapshot =
                        RoomSnapshot { algorithm: room.algorithm, members: room.members.clone() };
                    (room_id.clone(), snapshot)
                })
                .collect(),
            index: state.session_index.clone(),
            outbound_rooms: state
                .own
                .as_ref()
                .map(|own| own.megolm_out.keys().cloned().collect())
                .unwrap_or_default(),
            ..Self::default()
        };
        for user in &state.users {
            for device in &user.devices {
                let key = &device.keys.curve25519;
                view.olm_sessions.extend(
                    device
                        .olm_sessions
                        .keys()
                        .map(|id| (user.user_id.clone(), key.clone(), id.clone())),
                );
                view.megolm_sessions.extend(
                    device
                        .megolm_sessions
                        .keys()
                        .map(|id| (user.user_id.clone(), key.clone(), id.clone())),
                );
            }
        }
        view
    }
}

/// One client at one point in time.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Owning user
    pub user_id: UserId,
    /// Our device
    pub device_id: DeviceId,
    /// In-memory state
    pub memory: StateView,
    /// State a restart would load
    pub persisted: StateView,
    /// Outbound session per room, in memory
    pub outbound: BTreeMap<RoomId, SessionId>,
}

impl ClientSnapshot {
    /// Capture `machine`, loading its store.
    pub fn capture<C, T, S, E>(machine: &CryptoMachine<C, T, S, E>) -> Result<Self, StorageError>
    where
        C: CipherSuite,
        T: Transport,
        S: Storage,
        E: Environment,
    {
        let stored = machine.store().load(machine.user_id(), machine.device_id())?;
        let persisted = StateView::from_stored(&stored);

        let mut memory = StateView {
            index: machine
                .session_index()
                .iter()
                .map(|(triplet, pointers)| (triplet.clone(), pointers.clone()))
                .collect(),
            ..StateView::default()
        };
        for room in machine.rooms() {
            let members = Membership::ALL
                .into_iter()
                .flat_map(move |membership| {
                    room.members(membership).map(move |user_id| (user_id.clone(), membership))
                })
                .collect();
            let snapshot = RoomSnapshot { algorithm: room.algorithm(), members };
            memory.rooms.insert(room.room_id().clone(), snapshot);
        }
        for user in machine.directory().users() {
            for device in user.devices() {
                let owner = user.user_id();
                let key = device.curve25519();
                memory.olm_sessions.extend(
                    device.olm_session_ids().map(|id| (owner.clone(), key.clone(), id.clone())),
                );
                memory.megolm_sessions.extend(
                    device.megolm_session_ids().map(|id| (owner.clone(), key.clone(), id.clone())),
                );
            }
        }

        let candidates: BTreeSet<&RoomId> =
            machine.rooms().map(|room| room.room_id()).chain(&persisted.outbound_rooms).collect();
        let outbound: BTreeMap<RoomId, SessionId> = candidates
            .into_iter()
            .filter_map(|room_id| {
                machine.outbound_session_id(room_id).map(|id| (room_id.clone(), id))
            })
            .collect();
        memory.outbound_rooms = outbound.keys().cloned().collect();

        Ok(Self {
            user_id: machine.user_id().clone(),
            device_id: machine.device_id().clone(),
            memory,
            persisted,
            outbound,
        })
    }
}

/// Snapshot of every client of a simulation.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Per-client snapshots
    pub clients: Vec<ClientSnapshot>,
    /// Algorithms observed per (client, room), oldest first
    pub algorithm_history: BTreeMap<(UserId, DeviceId, RoomId), Vec<Algorithm>>,
}

impl SystemSnapshot {
    /// No clients.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of a single client.
    pub fn single(client: ClientSnapshot) -> Self {
        let mut snapshot = Self::empty();
        snapshot.add_client(client);
        snapshot
    }

    /// Add a client, appending its room algorithms to the history.
    pub fn add_client(&mut self, client: ClientSnapshot) {
        for (room_id, room) in &client.memory.rooms {
            let key = (client.user_id.clone(), client.device_id.clone(), room_id.clone());
            self.algorithm_history.entry(key).or_default().push(room.algorithm);
        }
        self.clients.push(client);
    }

    /// Replace the client snapshots while keeping the algorithm history,
    /// so monotonicity can be checked across a run.
    pub fn advance(&mut self, clients: Vec<ClientSnapshot>) {
        self.clients.clear();
        for client in clients {
            self.add_client(client);
        }
    }
}
