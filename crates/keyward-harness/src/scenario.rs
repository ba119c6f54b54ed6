//! Seeded workloads over several simulated clients.
//!
//! A [`Scenario`] turns a seed into a stream of [`Operation`]s. A [`World`]
//! applies them to real machines sharing one [`SimHomeserver`] and checks
//! the standard invariants between steps. The same seed always produces the
//! same run.

use std::time::Duration;

use keyward_core::{ErrorClass, MachineError};
use keyward_proto::{Algorithm, Membership, RoomId, UserId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    client::{TestMachine, new_client, sync},
    invariants::{ClientSnapshot, InvariantRegistry, SystemSnapshot, Violation},
    sim_env::SimEnv,
    sim_homeserver::SimHomeserver,
};

/// Client index within a [`World`].
pub type ClientId = usize;

/// Room index within a [`World`].
pub type RoomIndex = u8;

/// One step of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Server records the client as joined.
    Join {
        /// Joining client
        client: ClientId,
        /// Target room
        room: RoomIndex,
    },
    /// Server records the client as having left.
    Leave {
        /// Leaving client
        client: ClientId,
        /// Target room
        room: RoomIndex,
    },
    /// Client asks for a room algorithm.
    EnableEncryption {
        /// Requesting client
        client: ClientId,
        /// Target room
        room: RoomIndex,
        /// Requested algorithm
        algorithm: Algorithm,
    },
    /// Client sends a text message.
    Send {
        /// Sender
        client: ClientId,
        /// Target room
        room: RoomIndex,
    },
    /// Client discards its outbound group session.
    RotateSession {
        /// Owner
        client: ClientId,
        /// Target room
        room: RoomIndex,
    },
    /// Client fetches and applies one sync batch.
    Sync {
        /// Syncing client
        client: ClientId,
    },
    /// Virtual time passes.
    AdvanceTime {
        /// Milliseconds to advance
        millis: u64,
    },
}

/// Deterministic operation generator.
pub struct Scenario {
    rng: ChaCha8Rng,
    clients: usize,
    rooms: RoomIndex,
}

impl Scenario {
    /// Generator over `clients` clients and `rooms` rooms.
    pub fn new(seed: u64, clients: usize, rooms: RoomIndex) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed), clients: clients.max(1), rooms: rooms.max(1) }
    }

    /// Next operation. Syncs are the most common step so state keeps
    /// flowing between clients.
    pub fn next_operation(&mut self) -> Operation {
        let client = self.rng.gen_range(0..self.clients);
        let room = self.rng.gen_range(0..self.rooms);
        match self.rng.gen_range(0..100u32) {
            0..=14 => Operation::Join { client, room },
            15..=19 => Operation::Leave { client, room },
            20..=27 => {
                let algorithm = match self.rng.gen_range(0..4u32) {
                    0 => Algorithm::None,
                    1 => Algorithm::Olm,
                    _ => Algorithm::Megolm,
                };
                Operation::EnableEncryption { client, room, algorithm }
            },
            28..=49 => Operation::Send { client, room },
            50..=52 => Operation::RotateSession { client, room },
            53..=94 => Operation::Sync { client },
            _ => Operation::AdvanceTime { millis: self.rng.gen_range(1..5_000) },
        }
    }

    /// The next `count` operations.
    pub fn operations(&mut self, count: usize) -> Vec<Operation> {
        (0..count).map(|_| self.next_operation()).collect()
    }
}

/// Room id of a room index.
pub fn room_id(room: RoomIndex) -> RoomId {
    RoomId::from(format!("!room{room}:sim"))
}

/// User id of a client index.
pub fn user_id(client: ClientId) -> UserId {
    UserId::from(format!("@user{client}:sim"))
}

/// Clients sharing one simulated homeserver and clock.
pub struct World {
    server: SimHomeserver,
    env: SimEnv,
    clients: Vec<TestMachine>,
    registry: InvariantRegistry,
    history: SystemSnapshot,
}

impl World {
    /// `count` fresh clients, one device each, keys published.
    pub async fn new(count: usize) -> Result<Self, MachineError> {
        let (server, env) = (SimHomeserver::new(), SimEnv::new());
        let mut clients = Vec::with_capacity(count);
        for client in 0..count {
            let user = user_id(client);
            clients.push(new_client(&server, &env, user.as_str(), "DEVICE").await?);
        }
        let registry = InvariantRegistry::standard();
        Ok(Self { server, env, clients, registry, history: SystemSnapshot::empty() })
    }

    /// The shared homeserver.
    pub fn server(&self) -> &SimHomeserver {
        &self.server
    }

    /// The shared clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Machine of `client`.
    pub fn client(&self, client: ClientId) -> Option<&TestMachine> {
        self.clients.get(client)
    }

    /// Apply one operation.
    ///
    /// Returns every error it produced: the operation's own error, or the
    /// per-event failures of a sync batch. Operations on unknown clients do
    /// nothing.
    pub async fn apply(&mut self, operation: &Operation) -> Vec<MachineError> {
        let result = match *operation {
            Operation::Join { client, room } => {
                self.server.join(&room_id(room), &user_id(client));
                Ok(Vec::new())
            },
            Operation::Leave { client, room } => {
                self.server.set_membership(&room_id(room), &user_id(client), Membership::Leave);
                Ok(Vec::new())
            },
            Operation::EnableEncryption { client, room, algorithm } => {
                match self.clients.get_mut(client) {
                    Some(machine) => {
                        machine.set_algorithm(&room_id(room), algorithm).await.map(|()| Vec::new())
                    },
                    None => Ok(Vec::new()),
                }
            },
            Operation::Send { client, room } => match self.clients.get_mut(client) {
                Some(machine) => machine
                    .send_text(&room_id(room), "simulated")
                    .await
                    .map(|report| report.failures.into_iter().map(|f| f.error).collect()),
                None => Ok(Vec::new()),
            },
            Operation::RotateSession { client, room } => match self.clients.get_mut(client) {
                Some(machine) => machine.rotate_room_session(&room_id(room)).map(|_| Vec::new()),
                None => Ok(Vec::new()),
            },
            Operation::Sync { client } => match self.clients.get_mut(client) {
                Some(machine) => sync(machine)
                    .await
                    .map(|report| report.failures().map(|(_, error)| error.clone()).collect()),
                None => Ok(Vec::new()),
            },
            Operation::AdvanceTime { millis } => {
                self.env.advance(Duration::from_millis(millis));
                Ok(Vec::new())
            },
        };

        let errors = result.unwrap_or_else(|error| vec![error]);
        for error in &errors {
            tracing::debug!(?operation, class = ?error.class(), %error, "Operation error");
        }
        errors
    }

    /// Capture every client and run the standard invariants.
    ///
    /// Algorithm history accumulates across calls.
    pub fn check_invariants(&mut self) -> Result<(), Vec<Violation>> {
        let mut snapshots = Vec::with_capacity(self.clients.len());
        for machine in &self.clients {
            match ClientSnapshot::capture(machine) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(error) => {
                    let violation = Violation::new("Capture", format!("store load failed: {error}"))
                        .on(machine.user_id(), machine.device_id());
                    return Err(vec![violation]);
                },
            }
        }
        self.history.advance(snapshots);
        self.registry.check_all(&self.history)
    }

    /// Run `operations`, checking invariants after each one.
    ///
    /// Stops at the first violation. Returns all operation errors otherwise.
    pub async fn run(
        &mut self,
        operations: &[Operation],
    ) -> Result<Vec<MachineError>, Vec<Violation>> {
        let mut errors = Vec::new();
        for operation in operations {
            errors.extend(self.apply(operation).await);
            self.check_invariants()?;
        }
        Ok(errors)
    }
}

/// True for error classes a workload can legitimately produce.
pub fn is_expected(error: &MachineError) -> bool {
    !matches!(error.class(), ErrorClass::Fatal)
}
