//! Device-list tracking across failed queries and membership changes.

use keyward_core::{ErrorClass, TransportError};
use keyward_harness::{Endpoint, SimEnv, SimHomeserver, new_client, sync};
use keyward_proto::{Algorithm, DeviceId, Membership, RoomId, UserId};

fn room() -> RoomId {
    RoomId::from("!tracking:sim")
}

fn alice() -> UserId {
    UserId::from("@alice:sim")
}

fn bob() -> UserId {
    UserId::from("@bob:sim")
}

#[tokio::test]
async fn failed_device_query_is_retried_on_next_send() {
    let (server, env) = (SimHomeserver::new(), SimEnv::new());
    let mut alice = new_client(&server, &env, "@alice:sim", "ALICE").await.unwrap();
    let _bob = new_client(&server, &env, "@bob:sim", "BOB").await.unwrap();
    server.join(&room(), &self::alice());
    server.join(&room(), &self::bob());
    sync(&mut alice).await.unwrap();
    alice.set_algorithm(&room(), Algorithm::Megolm).await.unwrap();
    alice.get_or_create_user(&self::alice()).await.unwrap();

    let queries = server.calls(Endpoint::QueryKeys);
    server.inject_failure(Endpoint::QueryKeys, TransportError::Timeout);
    let first = alice.send_text(&room(), "is anyone there").await.unwrap();

    let classes: Vec<_> = first.failures.iter().map(|f| f.error.class()).collect();
    assert_eq!(classes, [ErrorClass::Transient]);
    assert_eq!(first.failures[0].user_id, self::bob());
    let entry = alice.directory().user(&self::bob()).unwrap();
    assert!(entry.tracking());
    assert!(entry.outdated());
    assert!(entry.is_empty());

    let second = alice.send_text(&room(), "hello bob").await.unwrap();

    assert!(second.failures.is_empty());
    assert_eq!(server.calls(Endpoint::QueryKeys), queries + 2);
    let entry = alice.directory().user(&self::bob()).unwrap();
    assert!(!entry.outdated());
    assert_eq!(entry.len(), 1);
    assert!(!server.pending_to_device(&self::bob(), &DeviceId::from("BOB")).is_empty());
}

#[tokio::test]
async fn rejoined_user_is_queried_again() {
    let (server, env) = (SimHomeserver::new(), SimEnv::new());
    let mut alice = new_client(&server, &env, "@alice:sim", "ALICE").await.unwrap();
    let _bob = new_client(&server, &env, "@bob:sim", "BOB").await.unwrap();
    server.join(&room(), &self::alice());
    server.join(&room(), &self::bob());
    sync(&mut alice).await.unwrap();
    alice.set_algorithm(&room(), Algorithm::Megolm).await.unwrap();
    alice.send_text(&room(), "first").await.unwrap();
    assert_eq!(alice.directory().user(&self::bob()).unwrap().len(), 1);

    server.set_membership(&room(), &self::bob(), Membership::Leave);
    let report = sync(&mut alice).await.unwrap();
    assert!(report.failures().next().is_none());
    assert!(!alice.directory().user(&self::bob()).unwrap().tracking());

    // The change notice arrives while bob is untracked
    let _laptop = new_client(&server, &env, "@bob:sim", "LAPTOP").await.unwrap();
    sync(&mut alice).await.unwrap();
    assert_eq!(alice.directory().user(&self::bob()).unwrap().len(), 1);

    server.join(&room(), &self::bob());
    sync(&mut alice).await.unwrap();
    let sent = alice.send_text(&room(), "welcome back").await.unwrap();

    assert!(sent.failures.is_empty());
    let entry = alice.directory().user(&self::bob()).unwrap();
    assert!(entry.tracking());
    assert!(!entry.outdated());
    assert!(entry.device_by_id(&DeviceId::from("LAPTOP")).is_some());
    assert!(!server.pending_to_device(&self::bob(), &DeviceId::from("LAPTOP")).is_empty());
}
