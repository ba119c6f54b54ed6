//! Property tests for event processing and seeded multi-client workloads.

use keyward_core::SyncReport;
use keyward_harness::{
    Scenario, SimEnv, SimHomeserver, TestMachine, World, new_client, scenario::is_expected,
};
use keyward_proto::{
    Event, JoinedRoom, Membership, RoomId, SyncResponse, ToDeviceEvent, UserId,
    event_type::{ROOM_ENCRYPTED, ROOM_ENCRYPTION, ROOM_KEY, ROOM_MEMBER, ROOM_MESSAGE},
};
use proptest::prelude::*;
use serde_json::json;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(future)
}

fn room() -> RoomId {
    RoomId::from("!props:sim")
}

async fn lone_client() -> TestMachine {
    let (server, env) = (SimHomeserver::new(), SimEnv::new());
    new_client(&server, &env, "@alice:sim", "ALICE").await.unwrap()
}

/// Kinds of room event, well-formed or not.
#[derive(Debug, Clone, Copy)]
enum Shape {
    Member(u8, Membership),
    MemberWithoutStateKey,
    EnableMegolm,
    UnknownAlgorithm,
    PlaintextRoomKey,
    GarbageCiphertext,
    Message,
}

fn shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        (0u8..4, prop::sample::select(Membership::ALL.to_vec()))
            .prop_map(|(user, membership)| Shape::Member(user, membership)),
        Just(Shape::MemberWithoutStateKey),
        Just(Shape::EnableMegolm),
        Just(Shape::UnknownAlgorithm),
        Just(Shape::PlaintextRoomKey),
        Just(Shape::GarbageCiphertext),
        Just(Shape::Message),
    ]
}

fn user(index: u8) -> UserId {
    UserId::from(format!("@user{index}:sim"))
}

fn event(shape: Shape) -> Event {
    let sender = UserId::from("@mallory:sim");
    match shape {
        Shape::Member(index, membership) => {
            Event::new(ROOM_MEMBER, user(index), json!({ "membership": membership.as_str() }))
                .with_state_key(user(index).as_str())
        },
        Shape::MemberWithoutStateKey => {
            Event::new(ROOM_MEMBER, sender, json!({ "membership": "join" }))
        },
        Shape::EnableMegolm => {
            Event::new(ROOM_ENCRYPTION, sender, json!({ "algorithm": "m.megolm.v1.aes-sha2" }))
                .with_state_key("")
        },
        Shape::UnknownAlgorithm => {
            Event::new(ROOM_ENCRYPTION, sender, json!({ "algorithm": "m.rot13" }))
                .with_state_key("")
        },
        Shape::PlaintextRoomKey => Event::new(ROOM_KEY, sender, json!({ "session_key": "k" })),
        Shape::GarbageCiphertext => Event::new(
            ROOM_ENCRYPTED,
            sender,
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": "key",
                "session_id": "sid",
                "ciphertext": "not base64",
            }),
        ),
        Shape::Message => Event::new(ROOM_MESSAGE, sender, json!({ "body": "hi" })),
    }
}

fn batch(shapes: &[Shape]) -> SyncResponse {
    let mut joined = JoinedRoom::default();
    joined.timeline.events = shapes.iter().copied().map(event).collect();
    let mut response = SyncResponse { next_batch: "s-prop".to_string(), ..SyncResponse::default() };
    response.rooms.join.insert(room(), joined);
    response.to_device.events.push(ToDeviceEvent {
        sender: UserId::from("@mallory:sim"),
        event_type: ROOM_ENCRYPTED.to_string(),
        content: json!({ "algorithm": "m.olm.v1.curve25519-aes-sha2", "ciphertext": 7 }),
    });
    response
}

fn last_membership(shapes: &[Shape], index: u8) -> Option<Membership> {
    shapes.iter().rev().find_map(|shape| match *shape {
        Shape::Member(user, membership) if user == index => Some(membership),
        _ => None,
    })
}

#[test]
fn prop_batch_is_never_aborted() {
    proptest!(ProptestConfig::with_cases(32), |(shapes in prop::collection::vec(shape(), 0..40))| {
        let report: SyncReport = block_on(async {
            let mut machine = lone_client().await;
            machine.process_sync(batch(&shapes)).await.unwrap()
        });

        prop_assert_eq!(report.events.len(), shapes.len() + 1);
        prop_assert_eq!(report.next_batch.as_str(), "s-prop");
        let failed = report.failures().count();
        let well_formed = |shape: &&Shape| {
            matches!(shape, Shape::Member(..) | Shape::EnableMegolm | Shape::Message)
        };
        let malformed = shapes.iter().filter(|shape| !well_formed(shape)).count();
        prop_assert_eq!(failed, malformed + 1);
    });
}

#[test]
fn prop_membership_is_exclusive_and_latest_wins() {
    proptest!(ProptestConfig::with_cases(32), |(shapes in prop::collection::vec(shape(), 1..40))| {
        let machine = block_on(async {
            let mut machine = lone_client().await;
            machine.process_sync(batch(&shapes)).await.unwrap();
            machine
        });

        for index in 0..4 {
            let expected = last_membership(&shapes, index);
            let room_state = machine.room(&room());
            let actual = room_state.and_then(|r| r.membership(&user(index)));
            prop_assert_eq!(actual, expected);

            if let Some(room_state) = room_state {
                let listed: Vec<_> = Membership::ALL
                    .into_iter()
                    .filter(|m| room_state.members(*m).any(|u| *u == user(index)))
                    .collect();
                prop_assert_eq!(listed, expected.into_iter().collect::<Vec<_>>());
            }
        }
    });
}

#[test]
fn prop_seeded_workloads_keep_invariants() {
    proptest!(ProptestConfig::with_cases(12), |(seed in any::<u64>())| {
        let operations = Scenario::new(seed, 3, 2).operations(60);
        let outcome = block_on(async {
            let mut world = World::new(3).await.unwrap();
            world.run(&operations).await
        });

        match outcome {
            Ok(errors) => {
                let unexpected: Vec<_> = errors.iter().filter(|e| !is_expected(e)).collect();
                prop_assert!(unexpected.is_empty(), "seed {seed}: {unexpected:?}");
            },
            Err(violations) => {
                return Err(TestCaseError::fail(format!("seed {seed}: {violations:?}")));
            },
        }
    });
}
