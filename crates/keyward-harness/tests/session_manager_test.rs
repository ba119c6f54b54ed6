//! Pairwise and group session bookkeeping between two devices.

use std::collections::BTreeMap;

use keyward_core::{
    ErrorClass, MachineConfig, MachineError, Triplet,
    store::{MemoryStorage, Storage},
};
use keyward_crypto::{CipherSuite, OutboundGroupSession};
use keyward_harness::{
    ClientSnapshot, Endpoint, SimEnv, SimHomeserver, TestMachine, new_client, open_client, suite,
};
use keyward_proto::{
    Curve25519Key, OlmCiphertext, OlmContent, OlmMessageType, RoomId, UserId,
    event_type::ROOM_MESSAGE,
};
use serde_json::json;

fn room() -> RoomId {
    RoomId::from("!pair:sim")
}

fn alice() -> UserId {
    UserId::from("@alice:sim")
}

fn bob() -> UserId {
    UserId::from("@bob:sim")
}

fn curve(machine: &TestMachine) -> Curve25519Key {
    machine.identity().keys().curve25519.clone()
}

fn envelope(
    sender: &TestMachine,
    recipient: &TestMachine,
    ciphertext: OlmCiphertext,
) -> OlmContent {
    OlmContent {
        sender_key: curve(sender),
        ciphertext: BTreeMap::from([(curve(recipient), ciphertext)]),
    }
}

async fn pair() -> (SimHomeserver, TestMachine, TestMachine) {
    let (server, env) = (SimHomeserver::new(), SimEnv::new());
    let alice = new_client(&server, &env, "@alice:sim", "ALICE").await.unwrap();
    let bob = new_client(&server, &env, "@bob:sim", "BOB").await.unwrap();
    (server, alice, bob)
}

#[tokio::test]
async fn olm_hello_establishes_session_on_both_sides() {
    let (server, mut alice, mut bob) = pair().await;
    let (alice_key, bob_key) = (curve(&alice), curve(&bob));
    alice.get_or_create_user(&self::bob()).await.unwrap();

    let content = json!({ "msgtype": "m.text", "body": "hello" });
    let ciphertext =
        alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &content).await.unwrap();
    assert_eq!(ciphertext.message_type, OlmMessageType::PreKey);
    assert_eq!(server.calls(Endpoint::ClaimKeys), 1);

    let event = bob.decrypt_olm(&room(), &self::alice(), &envelope(&alice, &bob, ciphertext)).await;
    let event = event.unwrap();
    assert_eq!(event.event_type, ROOM_MESSAGE);
    assert_eq!(event.sender, self::alice());
    assert_eq!(event.content, content);

    let outbound = alice.session_index().olm(&Triplet::new(room(), self::bob(), bob_key)).cloned();
    let inbound = bob.session_index().olm(&Triplet::new(room(), self::alice(), alice_key)).cloned();
    assert!(outbound.is_some());
    assert_eq!(outbound, inbound);

    for machine in [&alice, &bob] {
        let snapshot = ClientSnapshot::capture(machine).unwrap();
        assert_eq!(snapshot.persisted.index, snapshot.memory.index);
        assert_eq!(snapshot.persisted.olm_sessions, snapshot.memory.olm_sessions);
        assert_eq!(snapshot.persisted.olm_sessions.len(), 1);
    }
}

#[tokio::test]
async fn reply_uses_the_inbound_session_without_a_claim() {
    let (server, mut alice, mut bob) = pair().await;
    let (alice_key, bob_key) = (curve(&alice), curve(&bob));
    alice.get_or_create_user(&self::bob()).await.unwrap();

    let hello = json!({ "body": "hello" });
    let first = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    bob.decrypt_olm(&room(), &self::alice(), &envelope(&alice, &bob, first)).await.unwrap();

    let reply = json!({ "body": "hi back" });
    let second = bob.encrypt_olm(&room(), &self::alice(), &alice_key, ROOM_MESSAGE, &reply).await;
    let second = second.unwrap();
    assert_eq!(server.calls(Endpoint::ClaimKeys), 1);

    let event = alice.decrypt_olm(&room(), &self::bob(), &envelope(&bob, &alice, second)).await.unwrap();
    assert_eq!(event.content, reply);

    let third = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    assert_eq!(third.message_type, OlmMessageType::Normal);
}

#[tokio::test]
async fn established_triplet_keeps_one_session() {
    let (server, mut alice, bob) = pair().await;
    let bob_key = curve(&bob);
    alice.get_or_create_user(&self::bob()).await.unwrap();

    let first = alice.ensure_olm_session(&room(), &self::bob(), &bob_key).await.unwrap();
    let second = alice.ensure_olm_session(&room(), &self::bob(), &bob_key).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(server.calls(Endpoint::ClaimKeys), 1);

    let device = alice.directory().lookup(&self::bob(), &bob_key).unwrap();
    assert_eq!(device.olm_session_ids().count(), 1);

    // Another room is another triplet with its own session
    let elsewhere = RoomId::from("!other:sim");
    let third = alice.ensure_olm_session(&elsewhere, &self::bob(), &bob_key).await.unwrap();
    assert_ne!(first, third);
    assert_eq!(server.calls(Endpoint::ClaimKeys), 2);
}

#[tokio::test]
async fn normal_message_without_session_is_rejected() {
    let (_server, mut alice, mut bob) = pair().await;
    let (alice_key, bob_key) = (curve(&alice), curve(&bob));
    alice.get_or_create_user(&self::bob()).await.unwrap();

    let hello = json!({ "body": "hello" });
    let first = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    bob.decrypt_olm(&room(), &self::alice(), &envelope(&alice, &bob, first)).await.unwrap();
    let reply = bob.encrypt_olm(&room(), &self::alice(), &alice_key, ROOM_MESSAGE, &hello).await;
    alice.decrypt_olm(&room(), &self::bob(), &envelope(&bob, &alice, reply.unwrap())).await.unwrap();

    let normal = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    assert_eq!(normal.message_type, OlmMessageType::Normal);

    // Same ciphertext addressed to a room the session is not indexed under
    let elsewhere = RoomId::from("!other:sim");
    let err = bob.decrypt_olm(&elsewhere, &self::alice(), &envelope(&alice, &bob, normal)).await;
    let err = err.unwrap_err();
    assert!(matches!(err, MachineError::NoOlmSession { .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::SessionMissing);
}

/// Fresh store holding only the published account of `machine`, as if its
/// sessions were lost.
fn account_only(machine: &TestMachine) -> MemoryStorage {
    let (user_id, device_id) = (machine.user_id().clone(), machine.device_id().clone());
    let own = machine.store().load(&user_id, &device_id).unwrap().own.unwrap();
    let restored = MemoryStorage::new();
    restored.store_account(&user_id, &device_id, &own.account).unwrap();
    restored.mark_keys_published(&user_id, &device_id).unwrap();
    restored
}

#[tokio::test]
async fn pre_key_message_for_a_new_session_replaces_the_current_one() {
    let (server, env) = (SimHomeserver::new(), SimEnv::new());
    let mut alice = new_client(&server, &env, "@alice:sim", "ALICE").await.unwrap();
    let mut bob = new_client(&server, &env, "@bob:sim", "BOB").await.unwrap();
    let (alice_key, bob_key) = (curve(&alice), curve(&bob));
    let backup = account_only(&alice);
    let triplet = Triplet::new(room(), self::alice(), alice_key.clone());

    alice.get_or_create_user(&self::bob()).await.unwrap();
    let hello = json!({ "body": "hello" });
    let first = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    bob.decrypt_olm(&room(), &self::alice(), &envelope(&alice, &bob, first)).await.unwrap();
    let old_session = bob.session_index().olm(&triplet).cloned().unwrap();

    let config = MachineConfig::default();
    let mut restored = open_client(&server, &env, backup, "@alice:sim", "ALICE", config).unwrap();
    assert_eq!(curve(&restored), alice_key);
    restored.get_or_create_user(&self::bob()).await.unwrap();
    let again = json!({ "body": "hello again" });
    let second =
        restored.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &again).await.unwrap();
    assert_eq!(second.message_type, OlmMessageType::PreKey);
    assert_eq!(server.calls(Endpoint::ClaimKeys), 2);

    let envelope = OlmContent {
        sender_key: alice_key.clone(),
        ciphertext: BTreeMap::from([(bob_key, second)]),
    };
    let event = bob.decrypt_olm(&room(), &self::alice(), &envelope).await.unwrap();
    assert_eq!(event.content, again);

    let new_session = bob.session_index().olm(&triplet).cloned().unwrap();
    assert_ne!(new_session, old_session);
    let outbound = restored.session_index().olm(&Triplet::new(room(), self::bob(), curve(&bob)));
    assert_eq!(outbound, Some(&new_session));
    let device = bob.directory().lookup(&self::alice(), &alice_key).unwrap();
    assert_eq!(device.olm_session_ids().count(), 2);

    let snapshot = ClientSnapshot::capture(&bob).unwrap();
    assert_eq!(snapshot.persisted.index, snapshot.memory.index);
}

#[tokio::test]
async fn failing_normal_message_is_not_retried_as_a_new_session() {
    let (_server, mut alice, mut bob) = pair().await;
    let (alice_key, bob_key) = (curve(&alice), curve(&bob));
    alice.get_or_create_user(&self::bob()).await.unwrap();

    let hello = json!({ "body": "hello" });
    let first = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    bob.decrypt_olm(&room(), &self::alice(), &envelope(&alice, &bob, first)).await.unwrap();
    let reply = bob.encrypt_olm(&room(), &self::alice(), &alice_key, ROOM_MESSAGE, &hello).await;
    alice.decrypt_olm(&room(), &self::bob(), &envelope(&bob, &alice, reply.unwrap())).await.unwrap();

    let normal = alice.encrypt_olm(&room(), &self::bob(), &bob_key, ROOM_MESSAGE, &hello).await.unwrap();
    assert_eq!(normal.message_type, OlmMessageType::Normal);
    let normal = envelope(&alice, &bob, normal);
    bob.decrypt_olm(&room(), &self::alice(), &normal).await.unwrap();
    let triplet = Triplet::new(room(), self::alice(), alice_key.clone());
    let current = bob.session_index().olm(&triplet).cloned();

    // A replay fails on the current session and nothing else is tried
    let err = bob.decrypt_olm(&room(), &self::alice(), &normal).await.unwrap_err();
    assert!(!matches!(err, MachineError::NoOlmSession { .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::ProtocolViolation);

    assert_eq!(bob.session_index().olm(&triplet).cloned(), current);
    let device = bob.directory().lookup(&self::alice(), &alice_key).unwrap();
    assert_eq!(device.olm_session_ids().count(), 1);
}

#[tokio::test]
async fn inbound_group_session_id_is_bound_to_one_key() {
    let (_server, alice, mut bob) = pair().await;
    let alice_key = curve(&alice);
    bob.get_or_create_user(&self::alice()).await.unwrap();

    let mut group = suite().create_outbound_group_session();
    let session_id = group.session_id();
    let original = group.session_key();

    bob.install_inbound(&self::alice(), &alice_key, &session_id, &original).unwrap();
    bob.install_inbound(&self::alice(), &alice_key, &session_id, &original).unwrap();

    group.encrypt(b"advance the ratchet");
    let advanced = group.session_key();
    assert_ne!(advanced, original);

    let err = bob.install_inbound(&self::alice(), &alice_key, &session_id, &advanced).unwrap_err();
    assert!(matches!(err, MachineError::SessionKeyConflict { .. }), "{err}");

    let device = bob.directory().lookup(&self::alice(), &alice_key).unwrap();
    assert_eq!(device.megolm_session_ids().count(), 1);
}
