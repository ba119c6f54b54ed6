//! Storage failures must never leave memory ahead of what a restart loads.
//!
//! Alice's store fails a fraction of all writes while Bob keeps talking to
//! her. After every step the store is read back with failures paused and the
//! standard invariants are checked. Finally Alice restarts from the
//! surviving data.

use keyward_core::{
    ErrorClass, MachineConfig,
    store::{ChaoticStorage, MemoryStorage},
};
use keyward_harness::{
    ClientSnapshot, InvariantRegistry, SimEnv, SimHomeserver, SystemSnapshot, TestMachine,
    new_client, open_client, sync,
};
use keyward_proto::{Algorithm, RoomId, UserId};
use proptest::prelude::*;

type ChaoticMachine = TestMachine<ChaoticStorage<MemoryStorage>>;

fn room() -> RoomId {
    RoomId::from("!chaos:sim")
}

fn check(
    registry: &InvariantRegistry,
    history: &mut SystemSnapshot,
    alice: &ChaoticMachine,
    store: &ChaoticStorage<MemoryStorage>,
    failure_rate: f64,
    step: &str,
) {
    store.set_failure_rate(0.0);
    let snapshot = ClientSnapshot::capture(alice).unwrap();
    store.set_failure_rate(failure_rate);
    history.advance(vec![snapshot]);
    registry.assert_all(history, step);
}

fn run(seed: u64, failure_rate: f64) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async {
        let (server, env) = (SimHomeserver::new(), SimEnv::new());
        let store = ChaoticStorage::with_seed(MemoryStorage::new(), 0.0, seed);
        let config = MachineConfig::default();
        let mut alice =
            open_client(&server, &env, store.clone(), "@alice:sim", "ALICE", config.clone())
                .unwrap();
        alice.publish_keys().await.unwrap();
        let mut bob = new_client(&server, &env, "@bob:sim", "BOB").await.unwrap();

        server.join(&room(), &UserId::from("@alice:sim"));
        server.join(&room(), &UserId::from("@bob:sim"));
        sync(&mut bob).await.unwrap();
        bob.set_algorithm(&room(), Algorithm::Megolm).await.unwrap();

        let registry = InvariantRegistry::standard();
        let mut history = SystemSnapshot::empty();
        store.set_failure_rate(failure_rate);

        for round in 0..8 {
            bob.send_text(&room(), &format!("round {round}")).await.unwrap();
            if round % 3 == 2 {
                bob.rotate_room_session(&room()).unwrap();
            }

            if let Err(error) = sync(&mut alice).await {
                assert_eq!(error.class(), ErrorClass::Fatal, "round {round}: {error}");
            }
            check(&registry, &mut history, &alice, &store, failure_rate, "after sync");

            match alice.send_text(&room(), "reply").await {
                Ok(report) => {
                    for failure in report.failures {
                        assert_ne!(failure.error.class(), ErrorClass::ProtocolViolation);
                    }
                },
                Err(error) => assert_eq!(error.class(), ErrorClass::Fatal, "{error}"),
            }
            check(&registry, &mut history, &alice, &store, failure_rate, "after send");

            sync(&mut bob).await.unwrap();
        }

        store.set_failure_rate(0.0);
        let before = ClientSnapshot::capture(&alice).unwrap();
        drop(alice);

        let reopened =
            open_client(&server, &env, store.inner().clone(), "@alice:sim", "ALICE", config)
                .unwrap();
        let after = ClientSnapshot::capture(&reopened).unwrap();
        assert_eq!(after.memory.rooms, before.memory.rooms);
        assert_eq!(after.memory.index, before.memory.index);
        assert_eq!(after.outbound, before.outbound);
        assert!(before.memory.olm_sessions.is_subset(&after.memory.olm_sessions));
        assert!(before.memory.megolm_sessions.is_subset(&after.memory.megolm_sessions));
    });
}

#[test]
fn moderate_chaos_keeps_invariants() {
    run(0xC0FFEE, 0.2);
}

#[test]
fn prop_chaos_keeps_invariants() {
    proptest!(ProptestConfig::with_cases(8), |(seed in any::<u64>(), rate in 0.0..0.5f64)| {
        run(seed, rate);
    });
}
