//! Fuzz target for multi-client workloads
//!
//! Drives a small simulated world with arbitrary operation sequences and
//! checks the standard invariants after every step.
//!
//! # Invariants
//!
//! - No operation fails with a fatal error on healthy infrastructure
//! - The session index only points at installed sessions
//! - A room's algorithm never downgrades
//! - In-memory state never runs ahead of the store

#![no_main]

use arbitrary::Arbitrary;
use keyward_core::ErrorClass;
use keyward_harness::{Operation, World};
use keyward_proto::Algorithm;
use libfuzzer_sys::fuzz_target;

const CLIENTS: usize = 3;
const ROOMS: u8 = 2;

#[derive(Debug, Clone, Arbitrary)]
struct Workload {
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Step {
    Join { client: u8, room: u8 },
    Leave { client: u8, room: u8 },
    EnableEncryption { client: u8, room: u8, megolm: bool },
    Send { client: u8, room: u8 },
    RotateSession { client: u8, room: u8 },
    Sync { client: u8 },
    AdvanceTime { millis: u16 },
}

impl Step {
    fn into_operation(self) -> Operation {
        let client = |c: u8| usize::from(c) % CLIENTS;
        let room = |r: u8| r % ROOMS;
        match self {
            Self::Join { client: c, room: r } => {
                Operation::Join { client: client(c), room: room(r) }
            },
            Self::Leave { client: c, room: r } => {
                Operation::Leave { client: client(c), room: room(r) }
            },
            Self::EnableEncryption { client: c, room: r, megolm } => Operation::EnableEncryption {
                client: client(c),
                room: room(r),
                algorithm: if megolm { Algorithm::Megolm } else { Algorithm::Olm },
            },
            Self::Send { client: c, room: r } => {
                Operation::Send { client: client(c), room: room(r) }
            },
            Self::RotateSession { client: c, room: r } => {
                Operation::RotateSession { client: client(c), room: room(r) }
            },
            Self::Sync { client: c } => Operation::Sync { client: client(c) },
            Self::AdvanceTime { millis } => Operation::AdvanceTime { millis: u64::from(millis) },
        }
    }
}

fuzz_target!(|workload: Workload| {
    if workload.steps.len() > 64 {
        return;
    }
    let operations: Vec<Operation> =
        workload.steps.into_iter().map(Step::into_operation).collect();

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().build() else {
        return;
    };
    runtime.block_on(async {
        let Ok(mut world) = World::new(CLIENTS).await else {
            return;
        };
        match world.run(&operations).await {
            Ok(errors) => {
                for error in errors {
                    assert_ne!(error.class(), ErrorClass::Fatal, "fatal error: {error}");
                }
            },
            Err(violations) => panic!("invariants violated: {violations:?}"),
        }
    });
});
