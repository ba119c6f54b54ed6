//! Keyward
//!
//! End-to-end encryption state manager for a Matrix-style chat client. Keeps
//! track of which devices exist, which pairwise (olm) and group (megolm)
//! sessions we hold with them, and which algorithm each room uses, and turns
//! sync batches into decrypted events and outgoing messages into ciphertext.
//!
//! # Architecture
//!
//! All state lives in one [`CryptoMachine`], generic over four seams:
//!
//! - [`CipherSuite`](keyward_crypto::CipherSuite): account, session and
//!   pickle primitives (vodozemac in production)
//! - [`Transport`]: the homeserver endpoints the machine calls
//! - [`Storage`](store::Storage): durable state, written before memory
//! - [`Environment`](env::Environment): clocks and sleeping
//!
//! The simulation harness swaps the last three for deterministic versions.
//!
//! # Components
//!
//! - [`OwnIdentity`]: our account and key publication
//! - [`DeviceDirectory`]: remote users, devices and their sessions
//! - [`SessionIndex`]: current session per (room, user, device key)
//! - [`Room`]: algorithm and membership per room
//! - [`SyncLoop`]: long-poll driver with backoff
//!
//! # Invariants
//!
//! - Persistent state is written before in-memory state, so a restart never
//!   sees a session the store does not know about.
//! - A room's algorithm moves from `None` to one concrete algorithm at most
//!   once.
//! - One failing event never aborts a sync batch.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod directory;
mod echo;
pub mod env;
mod error;
mod identity;
mod index;
mod machine;
mod megolm;
mod olm;
mod pipeline;
mod room;
pub mod store;
mod sync;
mod system_env;
mod transport;

pub use config::{MachineConfig, SyncConfig};
pub use directory::{DeviceDirectory, DeviceInsert, RemoteDevice, UserDevices};
pub use env::Environment;
pub use error::{ErrorClass, MachineError};
pub use identity::OwnIdentity;
pub use index::{SessionIndex, SessionPointers, Triplet};
pub use machine::{CryptoMachine, SharedMachine};
pub use pipeline::{
    DecryptedEvent, DeliveryFailure, EventOutcome, ProcessedEvent, SendReport, SyncReport,
};
pub use room::Room;
pub use sync::SyncLoop;
pub use system_env::SystemEnv;
pub use transport::{Transport, TransportError};
