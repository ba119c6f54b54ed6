//! In-memory homeserver for simulation.
//!
//! `SimHomeserver` keeps device keys, one-time key pools, a single room event
//! log with membership, and a to-device queue per device. A new device is
//! reported as changed to every other device, and a member who stops sharing
//! any joined room is reported as left. Each device talks to it through its
//! own [`SimTransport`]. Every endpoint counts its calls
//! and can be scripted to fail, so tests can assert "no network call" and
//! drive the machine through transient and permanent failures.
//!
//! Sync never blocks: it returns whatever is new since the token, and an
//! empty batch if nothing is.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory state only")]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use keyward_core::{Transport, TransportError};
use keyward_proto::{
    DeviceId, DeviceKeys, Event, KeysClaimRequest, KeysClaimResponse, KeysQueryResponse,
    KeysUploadRequest, KeysUploadResponse, MemberContent, Membership, OneTimeKey, RoomId,
    SIGNED_CURVE25519, SyncResponse, ToDeviceEvent, ToDeviceMessages, UserId,
    event_type::ROOM_MEMBER,
};
use serde_json::{Value, json};

/// A homeserver endpoint, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    /// `/keys/query`
    QueryKeys,
    /// `/keys/claim`
    ClaimKeys,
    /// `/keys/upload`
    UploadKeys,
    /// `/sendToDevice`
    SendToDevice,
    /// `/state`
    SendStateEvent,
    /// `/send`
    SendMessageEvent,
    /// `/sync`
    Sync,
}

struct LoggedEvent {
    room_id: RoomId,
    event: Event,
}

#[derive(Default)]
struct DeviceQueue {
    to_device: Vec<ToDeviceEvent>,
    changed: BTreeSet<UserId>,
    left: BTreeSet<UserId>,
}

#[derive(Default)]
struct ServerState {
    device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
    one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, OneTimeKey>>>,
    log: Vec<LoggedEvent>,
    members: BTreeMap<RoomId, BTreeMap<UserId, Membership>>,
    queues: BTreeMap<(UserId, DeviceId), DeviceQueue>,
    calls: BTreeMap<Endpoint, u64>,
    /// Scripted outcomes per endpoint; `None` lets a call through
    faults: BTreeMap<Endpoint, VecDeque<Option<TransportError>>>,
}

fn is_joined(members: &BTreeMap<UserId, Membership>, user_id: &UserId) -> bool {
    members.get(user_id) == Some(&Membership::Join)
}

fn is_membership_of(event: &Event, user_id: &UserId) -> bool {
    event.event_type == ROOM_MEMBER && event.state_key.as_deref() == Some(user_id.as_str())
}

fn signed_key_count(pool: &BTreeMap<String, OneTimeKey>) -> u64 {
    let prefix = format!("{SIGNED_CURVE25519}:");
    pool.keys().filter(|key_id| key_id.starts_with(&prefix)).count() as u64
}

impl ServerState {
    fn enter(&mut self, endpoint: Endpoint) -> Result<(), TransportError> {
        *self.calls.entry(endpoint).or_default() += 1;
        match self.faults.get_mut(&endpoint).and_then(VecDeque::pop_front).flatten() {
            Some(error) => {
                tracing::debug!(?endpoint, %error, "Injected transport failure");
                Err(error)
            },
            None => Ok(()),
        }
    }

    fn append(&mut self, room_id: &RoomId, mut event: Event) -> String {
        let event_id = format!("${}", self.log.len() + 1);
        event.event_id = Some(event_id.clone());
        event.room_id = None;

        if event.event_type == ROOM_MEMBER {
            if let (Some(state_key), Ok(content)) =
                (event.state_key.as_deref(), event.content_as::<MemberContent>())
            {
                let user_id = UserId::from(state_key);
                let members = self.members.entry(room_id.clone()).or_default();
                let previous = members.insert(user_id.clone(), content.membership);
                if previous == Some(Membership::Join) && content.membership != Membership::Join {
                    self.notify_left(room_id, &user_id);
                }
            }
        }
        self.log.push(LoggedEvent { room_id: room_id.clone(), event });
        event_id
    }

    fn query_keys(&self, users: &[UserId]) -> KeysQueryResponse {
        let device_keys = users
            .iter()
            .filter_map(|user_id| {
                self.device_keys.get(user_id).map(|devices| (user_id.clone(), devices.clone()))
            })
            .collect();
        KeysQueryResponse { device_keys }
    }

    fn claim_keys(
        &mut self,
        request: &KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        let mut response = KeysClaimResponse::default();
        for (user_id, devices) in request {
            for (device_id, algorithm) in devices {
                let Some(pool) =
                    self.one_time_keys.get_mut(user_id).and_then(|pools| pools.get_mut(device_id))
                else {
                    continue;
                };
                let prefix = format!("{algorithm}:");
                let Some(key_id) = pool.keys().find(|id| id.starts_with(&prefix)).cloned() else {
                    continue;
                };
                let Some(key) = pool.remove(&key_id) else {
                    continue;
                };
                let value = serde_json::to_value(&key).map_err(|e| TransportError::Server {
                    status: 500,
                    message: e.to_string(),
                })?;
                response
                    .one_time_keys
                    .entry(user_id.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_default()
                    .insert(key_id, value);
            }
        }
        Ok(response)
    }

    fn upload_keys(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        request: &KeysUploadRequest,
    ) -> KeysUploadResponse {
        self.queues.entry((user_id.clone(), device_id.clone())).or_default();

        if let Some(keys) = &request.device_keys {
            let devices = self.device_keys.entry(user_id.clone()).or_default();
            if devices.insert(device_id.clone(), keys.clone()).is_none() {
                self.notify_device_change(user_id, device_id);
            }
        }

        let pool = self
            .one_time_keys
            .entry(user_id.clone())
            .or_default()
            .entry(device_id.clone())
            .or_default();
        pool.extend(request.one_time_keys.clone());

        KeysUploadResponse {
            one_time_key_counts: BTreeMap::from([(
                SIGNED_CURVE25519.to_string(),
                signed_key_count(pool),
            )]),
        }
    }

    fn notify_device_change(&mut self, user_id: &UserId, device_id: &DeviceId) {
        for ((owner, device), queue) in &mut self.queues {
            if (owner, device) != (user_id, device_id) {
                queue.changed.insert(user_id.clone());
            }
        }
    }

    /// Tell the members of `room_id` who no longer share any joined room
    /// with `user_id` to stop tracking it.
    fn notify_left(&mut self, room_id: &RoomId, user_id: &UserId) {
        let Some(room) = self.members.get(room_id) else {
            return;
        };
        let stranded: BTreeSet<UserId> = room
            .iter()
            .filter(|&(other, membership)| *membership == Membership::Join && other != user_id)
            .map(|(other, _)| other.clone())
            .filter(|other| {
                !self
                    .members
                    .values()
                    .any(|members| is_joined(members, other) && is_joined(members, user_id))
            })
            .collect();
        for ((owner, _), queue) in &mut self.queues {
            if stranded.contains(owner) {
                queue.left.insert(user_id.clone());
            }
        }
    }

    fn send_to_device(&mut self, sender: &UserId, event_type: &str, messages: &ToDeviceMessages) {
        for (user_id, devices) in messages {
            for (device_id, content) in devices {
                let targets: Vec<DeviceId> = if device_id.as_str() == "*" {
                    self.device_keys
                        .get(user_id)
                        .map(|devices| devices.keys().cloned().collect())
                        .unwrap_or_default()
                } else {
                    vec![device_id.clone()]
                };
                for target in targets {
                    let Some(queue) = self.queues.get_mut(&(user_id.clone(), target)) else {
                        continue;
                    };
                    queue.to_device.push(ToDeviceEvent {
                        sender: sender.clone(),
                        event_type: event_type.to_string(),
                        content: content.clone(),
                    });
                }
            }
        }
    }

    fn sync(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        since: Option<&str>,
    ) -> Result<SyncResponse, TransportError> {
        let from = match since {
            None => 0,
            Some(token) => token
                .strip_prefix('s')
                .and_then(|position| position.parse::<usize>().ok())
                .ok_or_else(|| TransportError::Server {
                    status: 400,
                    message: format!("invalid since token {token}"),
                })?,
        };

        let mut response =
            SyncResponse { next_batch: format!("s{}", self.log.len()), ..SyncResponse::default() };
        for logged in self.log.iter().skip(from) {
            let membership =
                self.members.get(&logged.room_id).and_then(|members| members.get(user_id));
            let event = logged.event.clone();
            let rooms = &mut response.rooms;
            match membership {
                Some(Membership::Join) => {
                    let room = rooms.join.entry(logged.room_id.clone()).or_default();
                    room.timeline.events.push(event);
                },
                Some(Membership::Invite) if is_membership_of(&event, user_id) => {
                    let room = rooms.invite.entry(logged.room_id.clone()).or_default();
                    room.invite_state.events.push(event);
                },
                Some(Membership::Leave | Membership::Ban) if is_membership_of(&event, user_id) => {
                    let room = rooms.leave.entry(logged.room_id.clone()).or_default();
                    room.timeline.events.push(event);
                },
                _ => {},
            }
        }

        let queue = self.queues.entry((user_id.clone(), device_id.clone())).or_default();
        response.to_device.events = std::mem::take(&mut queue.to_device);
        response.device_lists.changed = std::mem::take(&mut queue.changed).into_iter().collect();
        response.device_lists.left = std::mem::take(&mut queue.left).into_iter().collect();

        let remaining = self
            .one_time_keys
            .get(user_id)
            .and_then(|pools| pools.get(device_id))
            .map_or(0, signed_key_count);
        response.device_one_time_keys_count.insert(SIGNED_CURVE25519.to_string(), remaining);
        Ok(response)
    }
}

/// Shared handle to the simulated homeserver.
#[derive(Clone, Default)]
pub struct SimHomeserver {
    state: Arc<Mutex<ServerState>>,
}

impl SimHomeserver {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport for one device.
    pub fn transport(&self, user_id: &UserId, device_id: &DeviceId) -> SimTransport {
        self.lock().queues.entry((user_id.clone(), device_id.clone())).or_default();
        SimTransport {
            server: self.clone(),
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        }
    }

    /// Record a membership change as a state event sent by the member.
    pub fn set_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> String {
        let content = json!({ "membership": membership.as_str() });
        let event =
            Event::new(ROOM_MEMBER, user_id.clone(), content).with_state_key(user_id.as_str());
        self.lock().append(room_id, event)
    }

    /// Join `user_id` to `room_id`.
    pub fn join(&self, room_id: &RoomId, user_id: &UserId) -> String {
        self.set_membership(room_id, user_id, Membership::Join)
    }

    /// Append an arbitrary event to a room's timeline.
    pub fn inject_room_event(&self, room_id: &RoomId, event: Event) -> String {
        self.lock().append(room_id, event)
    }

    /// Queue a raw to-device event for one device.
    pub fn inject_to_device(&self, user_id: &UserId, device_id: &DeviceId, event: ToDeviceEvent) {
        if let Some(queue) = self.lock().queues.get_mut(&(user_id.clone(), device_id.clone())) {
            queue.to_device.push(event);
        }
    }

    /// Server-side membership of `user_id` in `room_id`.
    pub fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Option<Membership> {
        self.lock().members.get(room_id).and_then(|members| members.get(user_id)).copied()
    }

    /// Every event sent to `room_id`, in order.
    pub fn room_events(&self, room_id: &RoomId) -> Vec<Event> {
        self.lock()
            .log
            .iter()
            .filter(|logged| logged.room_id == *room_id)
            .map(|logged| logged.event.clone())
            .collect()
    }

    /// To-device events waiting for the next sync of a device.
    pub fn pending_to_device(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<ToDeviceEvent> {
        self.lock()
            .queues
            .get(&(user_id.clone(), device_id.clone()))
            .map(|queue| queue.to_device.clone())
            .unwrap_or_default()
    }

    /// Published key bundle of a device.
    pub fn device_keys(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceKeys> {
        self.lock().device_keys.get(user_id).and_then(|devices| devices.get(device_id)).cloned()
    }

    /// Overwrite a published key bundle without notifying anyone.
    pub fn replace_device_keys(&self, user_id: &UserId, device_id: &DeviceId, keys: DeviceKeys) {
        self.lock().device_keys.entry(user_id.clone()).or_default().insert(device_id.clone(), keys);
    }

    /// Unclaimed `signed_curve25519` keys of a device.
    pub fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> u64 {
        self.lock()
            .one_time_keys
            .get(user_id)
            .and_then(|pools| pools.get(device_id))
            .map_or(0, signed_key_count)
    }

    /// Drop every unclaimed one-time key of a device.
    pub fn exhaust_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        if let Some(pool) =
            self.lock().one_time_keys.get_mut(user_id).and_then(|pools| pools.get_mut(device_id))
        {
            pool.clear();
        }
    }

    /// Make the next unscripted call to `endpoint` fail with `error`.
    /// Scripted outcomes are consumed in order.
    pub fn inject_failure(&self, endpoint: Endpoint, error: TransportError) {
        self.lock().faults.entry(endpoint).or_default().push_back(Some(error));
    }

    /// Let the next unscripted call to `endpoint` through, so failures queued
    /// after it hit later calls.
    pub fn inject_success(&self, endpoint: Endpoint) {
        self.lock().faults.entry(endpoint).or_default().push_back(None);
    }

    /// Calls made to `endpoint` so far, failed ones included.
    pub fn calls(&self, endpoint: Endpoint) -> u64 {
        self.lock().calls.get(&endpoint).copied().unwrap_or(0)
    }
}

/// One device's connection to a [`SimHomeserver`].
#[derive(Clone)]
pub struct SimTransport {
    server: SimHomeserver,
    user_id: UserId,
    device_id: DeviceId,
}

impl SimTransport {
    /// The server behind this transport.
    pub fn server(&self) -> &SimHomeserver {
        &self.server
    }

    fn call<R>(
        &self,
        endpoint: Endpoint,
        f: impl FnOnce(&mut ServerState) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let mut state = self.server.lock();
        state.enter(endpoint)?;
        f(&mut state)
    }
}

impl Transport for SimTransport {
    fn query_keys(
        &self,
        users: &[UserId],
    ) -> impl Future<Output = Result<KeysQueryResponse, TransportError>> + Send {
        std::future::ready(self.call(Endpoint::QueryKeys, |state| Ok(state.query_keys(users))))
    }

    fn claim_keys(
        &self,
        request: &KeysClaimRequest,
    ) -> impl Future<Output = Result<KeysClaimResponse, TransportError>> + Send {
        std::future::ready(self.call(Endpoint::ClaimKeys, |state| state.claim_keys(request)))
    }

    fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> impl Future<Output = Result<KeysUploadResponse, TransportError>> + Send {
        std::future::ready(self.call(Endpoint::UploadKeys, |state| {
            Ok(state.upload_keys(&self.user_id, &self.device_id, request))
        }))
    }

    fn send_to_device(
        &self,
        event_type: &str,
        messages: &ToDeviceMessages,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        std::future::ready(self.call(Endpoint::SendToDevice, |state| {
            state.send_to_device(&self.user_id, event_type, messages);
            Ok(())
        }))
    }

    fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        std::future::ready(self.call(Endpoint::SendStateEvent, |state| {
            let event = Event::new(event_type, self.user_id.clone(), content.clone())
                .with_state_key(state_key);
            Ok(state.append(room_id, event))
        }))
    }

    fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        std::future::ready(self.call(Endpoint::SendMessageEvent, |state| {
            let event = Event::new(event_type, self.user_id.clone(), content.clone());
            Ok(state.append(room_id, event))
        }))
    }

    fn sync(
        &self,
        since: Option<&str>,
        _timeout: Duration,
    ) -> impl Future<Output = Result<SyncResponse, TransportError>> + Send {
        std::future::ready(
            self.call(Endpoint::Sync, |state| state.sync(&self.user_id, &self.device_id, since)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::from("@alice:sim")
    }

    fn room() -> RoomId {
        RoomId::from("!room:sim")
    }

    #[tokio::test]
    async fn joined_user_sees_room_events_once() {
        let server = SimHomeserver::new();
        let transport = server.transport(&alice(), &DeviceId::from("A"));
        server.join(&room(), &alice());
        transport.send_message_event(&room(), "m.room.message", &json!({})).await.unwrap();

        let first = transport.sync(None, Duration::ZERO).await.unwrap();
        assert_eq!(first.rooms.join[&room()].timeline.events.len(), 2);
        assert_eq!(first.next_batch, "s2");

        let second = transport.sync(Some(&first.next_batch), Duration::ZERO).await.unwrap();
        assert!(second.rooms.join.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let server = SimHomeserver::new();
        let transport = server.transport(&alice(), &DeviceId::from("A"));
        server.inject_failure(Endpoint::Sync, TransportError::Timeout);

        assert_eq!(transport.sync(None, Duration::ZERO).await, Err(TransportError::Timeout));
        assert!(transport.sync(None, Duration::ZERO).await.is_ok());
        assert_eq!(server.calls(Endpoint::Sync), 2);
    }

    #[tokio::test]
    async fn claimed_key_leaves_the_pool() {
        let server = SimHomeserver::new();
        let transport = server.transport(&alice(), &DeviceId::from("A"));
        let key = OneTimeKey { key: "otk".into(), signatures: BTreeMap::new() };
        let request = KeysUploadRequest {
            device_keys: None,
            one_time_keys: BTreeMap::from([("signed_curve25519:AAA".to_string(), key)]),
        };
        transport.upload_keys(&request).await.unwrap();
        assert_eq!(server.one_time_key_count(&alice(), &DeviceId::from("A")), 1);

        let claim = BTreeMap::from([(
            alice(),
            BTreeMap::from([(DeviceId::from("A"), SIGNED_CURVE25519.to_string())]),
        )]);
        let response = transport.claim_keys(&claim).await.unwrap();
        assert!(response.has_device(&alice(), &DeviceId::from("A")));
        assert_eq!(server.one_time_key_count(&alice(), &DeviceId::from("A")), 0);

        let empty = transport.claim_keys(&claim).await.unwrap();
        assert!(!empty.has_device(&alice(), &DeviceId::from("A")));
    }
}
