//! Deterministic simulation harness for keyward.
//!
//! An in-memory homeserver ([`SimHomeserver`]) and a virtual clock
//! ([`SimEnv`]) stand in for the network and wall time, so whole
//! multi-device conversations run inside a single test with reproducible
//! results.
//!
//! # Invariant Testing
//!
//! The `invariants` module captures clients into snapshots and checks
//! properties that must survive any sequence of operations. The `scenario`
//! module generates seeded workloads and runs them against a [`World`] of
//! clients, checking [`InvariantRegistry::standard()`] after every step.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod invariants;
pub mod scenario;
pub mod sim_env;
pub mod sim_homeserver;

pub use client::{TestMachine, new_client, open_client, suite, sync};
pub use invariants::{
    AlgorithmMonotonicity, ClientSnapshot, IndexResolves, Invariant, InvariantRegistry,
    MemoryIsDurable, RoomSnapshot, StateView, SystemSnapshot, Violation,
};
pub use scenario::{Operation, Scenario, World};
pub use sim_env::SimEnv;
pub use sim_homeserver::{Endpoint, SimHomeserver, SimTransport};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a `RUST_LOG`-filtered subscriber for test output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}
