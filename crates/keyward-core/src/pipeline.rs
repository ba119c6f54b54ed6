//! Event pipeline: sync batches in, encrypted sends out.
//!
//! Inbound, every event is routed on its type. Encrypted envelopes are
//! decrypted first and their inner event routed the same way, so a room key
//! inside an olm message installs a group session and a membership change
//! updates the room. Each event gets its own outcome; one bad event never
//! aborts a batch.
//!
//! Outbound, the room's algorithm decides the wire form: plaintext, one olm
//! event carrying a ciphertext per recipient device, or one megolm event
//! after the room key has been shared.
//!
//! # Invariants
//!
//! - A room key is only accepted from inside an olm envelope.
//! - Decrypted payloads are never themselves encrypted envelopes.
//! - The sync token is stored only after every event of its batch has been
//!   processed.

use std::collections::BTreeMap;

use keyward_crypto::CipherSuite;
use keyward_proto::{
    Algorithm, Curve25519Key, DeviceId, EncryptedContent, EncryptionContent, Event, MemberContent,
    Membership, OlmContent, ProtocolError, RoomId, RoomKeyContent, SIGNED_CURVE25519, SessionId,
    SyncResponse, UserId,
    event_type::{
        FORWARDED_ROOM_KEY, ROOM_ENCRYPTED, ROOM_ENCRYPTION, ROOM_KEY, ROOM_KEY_REQUEST,
        ROOM_MEMBER, ROOM_MESSAGE,
    },
};
use serde_json::{Value, json};

use crate::{
    env::Environment, error::MachineError, machine::CryptoMachine, store::Storage,
    transport::Transport,
};

/// What processing an event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// A user's membership in the event's room was recorded
    MembershipUpdated {
        /// Member
        user_id: UserId,
        /// New state
        membership: Membership,
    },
    /// An `m.room.encryption` event was applied
    EncryptionEnabled {
        /// Algorithm named by the event
        algorithm: Algorithm,
        /// False if the room already used it
        changed: bool,
    },
    /// A room key arrived over olm and its session was installed
    RoomKeyInstalled {
        /// Room the session encrypts
        room_id: RoomId,
        /// Installed session
        session_id: SessionId,
    },
    /// No state change; the event is for the application
    Unhandled,
    /// Deliberately dropped
    Ignored {
        /// Why
        reason: String,
    },
}

/// Plaintext recovered from an encrypted event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    /// Inner event, carrying the envelope's room and event id
    pub event: Event,
    /// Algorithm of the envelope
    pub algorithm: Algorithm,
    /// Agreement key of the sending device
    pub sender_key: Curve25519Key,
    /// Megolm ratchet index, if the envelope was megolm
    pub message_index: Option<u32>,
    /// True if this is our own message resolved from the echo cache
    pub own_echo: bool,
}

/// One event of a sync batch after processing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    /// The event as received
    pub event: Event,
    /// Inner event, if the envelope could be decrypted
    pub decrypted: Option<DecryptedEvent>,
    /// What processing did, or why it failed
    pub outcome: Result<EventOutcome, MachineError>,
}

/// Result of applying one sync batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Token to resume from
    pub next_batch: String,
    /// Every event of the batch in processing order
    pub events: Vec<ProcessedEvent>,
    /// One-time keys uploaded because the server ran low
    pub one_time_keys_uploaded: usize,
}

impl SyncReport {
    /// Events whose processing failed.
    pub fn failures(&self) -> impl Iterator<Item = (&Event, &MachineError)> {
        self.events.iter().filter_map(|p| p.outcome.as_ref().err().map(|e| (&p.event, e)))
    }
}

/// A recipient an encrypted send could not reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    /// Recipient user
    pub user_id: UserId,
    /// Recipient device, `None` if the user's device list was unavailable
    pub device_id: Option<DeviceId>,
    /// Cause
    pub error: MachineError,
}

/// Result of [`CryptoMachine::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Id the server assigned, `None` if nothing was sent
    pub event_id: Option<String>,
    /// Algorithm the message went out with
    pub algorithm: Algorithm,
    /// Recipients that will not be able to read the message
    pub failures: Vec<DeliveryFailure>,
}

/// How an event reached the router.
#[derive(Clone, Copy)]
enum Origin<'a> {
    Plain,
    Olm { sender_key: &'a Curve25519Key },
    Megolm,
}

/// Bind a sync event to the room it was delivered under. A `room_id` the
/// event carries itself is not trusted.
fn in_room(mut event: Event, room_id: &RoomId) -> Event {
    if event.room_id.as_ref().is_some_and(|claimed| claimed != room_id) {
        tracing::warn!(%room_id, claimed = ?event.room_id, "Event names another room, rebinding");
    }
    event.room_id = Some(room_id.clone());
    event
}

fn require_room(event: &Event) -> Result<&RoomId, ProtocolError> {
    event.room_id.as_ref().ok_or_else(|| ProtocolError::MissingField {
        event_type: event.event_type.clone(),
        field: "room_id",
    })
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Apply a sync batch.
    ///
    /// Device-list changes are applied first, then to-device events (so room
    /// keys are in place before room timelines), then invited, joined and
    /// left rooms. Per-event failures end up in the report. The only error
    /// returned is a failure to store the new sync token.
    pub async fn process_sync(
        &mut self,
        response: SyncResponse,
    ) -> Result<SyncReport, MachineError> {
        let SyncResponse {
            next_batch,
            rooms,
            to_device,
            device_lists,
            device_one_time_keys_count,
        } = response;

        if let Err(error) = self.apply_device_lists(&device_lists.changed, &device_lists.left) {
            tracing::warn!(%error, "Failed to apply device list changes");
        }

        let mut events = Vec::new();
        for event in to_device.events {
            events.push(self.process_event(event.into_event()).await);
        }
        for (room_id, room) in rooms.invite {
            for event in room.invite_state.events {
                events.push(self.process_event(in_room(event, &room_id)).await);
            }
        }
        for (room_id, room) in rooms.join {
            for event in room.state.events.into_iter().chain(room.timeline.events) {
                events.push(self.process_event(in_room(event, &room_id)).await);
            }
        }
        for (room_id, room) in rooms.leave {
            for event in room.state.events.into_iter().chain(room.timeline.events) {
                events.push(self.process_event(in_room(event, &room_id)).await);
            }
        }

        let one_time_keys_uploaded = match device_one_time_keys_count.get(SIGNED_CURVE25519) {
            Some(&count) => self.top_up_one_time_keys(count).await.unwrap_or_else(|error| {
                tracing::warn!(%error, "Failed to top up one-time keys");
                0
            }),
            None => 0,
        };

        let (user_id, device_id) = (self.identity.user_id(), self.identity.device_id());
        self.store.store_sync_token(user_id, device_id, &next_batch)?;
        self.sync_token = Some(next_batch.clone());

        let failed = events.iter().filter(|p| p.outcome.is_err()).count();
        tracing::debug!(%next_batch, events = events.len(), failed, "Applied sync batch");
        Ok(SyncReport { next_batch, events, one_time_keys_uploaded })
    }

    /// Process a single event, decrypting it first if it is encrypted.
    pub async fn process_event(&mut self, event: Event) -> ProcessedEvent {
        if event.event_type != ROOM_ENCRYPTED {
            let outcome = self.route(&event, Origin::Plain);
            return ProcessedEvent { event, decrypted: None, outcome };
        }

        match self.decrypt_event(&event).await {
            Ok(Some(decrypted)) => {
                let outcome = self.route_decrypted(&decrypted);
                ProcessedEvent { event, decrypted: Some(decrypted), outcome }
            },
            Ok(None) => ProcessedEvent {
                event,
                decrypted: None,
                outcome: Ok(EventOutcome::Ignored {
                    reason: "no ciphertext for this device".to_string(),
                }),
            },
            Err(error) => {
                tracing::warn!(
                    sender = %event.sender,
                    room_id = ?event.room_id,
                    class = ?error.class(),
                    %error,
                    "Failed to decrypt event"
                );
                ProcessedEvent { event, decrypted: None, outcome: Err(error) }
            },
        }
    }

    /// Decrypt an `m.room.encrypted` event.
    ///
    /// Returns `Ok(None)` for an olm event that carries no ciphertext for
    /// this device. Our own echoes are answered from the echo cache.
    pub async fn decrypt_event(
        &mut self,
        event: &Event,
    ) -> Result<Option<DecryptedEvent>, MachineError> {
        let content = EncryptedContent::parse(&event.content)?;
        let algorithm = content.algorithm();
        let own_key = self.identity.keys().curve25519.clone();

        if event.sender == *self.identity.user_id() && *content.sender_key() == own_key {
            let mut inner =
                self.echoes.get(&event.content).cloned().ok_or(MachineError::OwnMessageNotCached)?;
            inner.event_id.clone_from(&event.event_id);
            return Ok(Some(DecryptedEvent {
                event: inner,
                algorithm,
                sender_key: own_key,
                message_index: None,
                own_echo: true,
            }));
        }

        let (mut inner, sender_key, message_index) = match content {
            EncryptedContent::Olm(olm) => {
                if !olm.ciphertext.contains_key(&own_key) {
                    return Ok(None);
                }
                let room_id = event
                    .room_id
                    .clone()
                    .unwrap_or_else(|| RoomId::send_to_device(&olm.sender_key));
                let inner = self.decrypt_olm(&room_id, &event.sender, &olm).await?;
                (inner, olm.sender_key, None)
            },
            EncryptedContent::Megolm(megolm) => {
                let room_id = require_room(event)?;
                let (inner, index) = self.decrypt_megolm(room_id, &event.sender, &megolm).await?;
                (inner, megolm.sender_key, Some(index))
            },
        };
        inner.event_id.clone_from(&event.event_id);

        Ok(Some(DecryptedEvent {
            event: inner,
            algorithm,
            sender_key,
            message_index,
            own_echo: false,
        }))
    }

    fn route_decrypted(
        &mut self,
        decrypted: &DecryptedEvent,
    ) -> Result<EventOutcome, MachineError> {
        if decrypted.event.event_type == ROOM_ENCRYPTED {
            return Err(MachineError::violation("decrypted payload is itself encrypted"));
        }
        if decrypted.own_echo {
            return Ok(EventOutcome::Unhandled);
        }
        let origin = match decrypted.algorithm {
            Algorithm::Olm => Origin::Olm { sender_key: &decrypted.sender_key },
            Algorithm::Megolm | Algorithm::None => Origin::Megolm,
        };
        self.route(&decrypted.event, origin)
    }

    fn route(&mut self, event: &Event, origin: Origin<'_>) -> Result<EventOutcome, MachineError> {
        match event.event_type.as_str() {
            ROOM_MEMBER => self.handle_membership(event),
            ROOM_ENCRYPTION => self.handle_encryption(event),
            ROOM_KEY => match origin {
                Origin::Olm { sender_key } => self.handle_room_key(event, sender_key),
                Origin::Plain | Origin::Megolm => {
                    Err(MachineError::violation("room key did not arrive over olm"))
                },
            },
            ROOM_KEY_REQUEST | FORWARDED_ROOM_KEY => {
                tracing::debug!(
                    event_type = %event.event_type,
                    sender = %event.sender,
                    "Ignoring key sharing event"
                );
                Ok(EventOutcome::Ignored { reason: "key sharing is not supported".to_string() })
            },
            _ => Ok(EventOutcome::Unhandled),
        }
    }

    fn handle_membership(&mut self, event: &Event) -> Result<EventOutcome, MachineError> {
        let room_id = require_room(event)?;
        let state_key = event.state_key.as_deref().ok_or_else(|| ProtocolError::MissingField {
            event_type: event.event_type.clone(),
            field: "state_key",
        })?;
        let MemberContent { membership, .. } = event.content_as()?;

        let user_id = UserId::from(state_key);
        self.apply_membership(room_id, &user_id, membership)?;
        Ok(EventOutcome::MembershipUpdated { user_id, membership })
    }

    fn handle_encryption(&mut self, event: &Event) -> Result<EventOutcome, MachineError> {
        let room_id = require_room(event)?;
        let algorithm = event.content_as::<EncryptionContent>()?.algorithm()?;
        let changed = self.apply_room_encryption(room_id, algorithm)?;
        Ok(EventOutcome::EncryptionEnabled { algorithm, changed })
    }

    fn handle_room_key(
        &mut self,
        event: &Event,
        sender_key: &Curve25519Key,
    ) -> Result<EventOutcome, MachineError> {
        let content: RoomKeyContent = event.content_as()?;
        self.accept_room_key(&event.sender, sender_key, &content)?;
        Ok(EventOutcome::RoomKeyInstalled {
            room_id: content.room_id,
            session_id: content.session_id,
        })
    }

    /// Send an event to `room_id` in the form the room's algorithm demands.
    ///
    /// Recipients that cannot be reached are reported in
    /// [`SendReport::failures`] without failing the send. Errors are
    /// reserved for failures that prevent sending at all.
    pub async fn send_message(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> Result<SendReport, MachineError> {
        let algorithm = self.room_algorithm(room_id);
        let (encrypted, failures) = match algorithm {
            Algorithm::None => {
                let event_id =
                    self.transport.send_message_event(room_id, event_type, &content).await?;
                let failures = Vec::new();
                return Ok(SendReport { event_id: Some(event_id), algorithm, failures });
            },
            Algorithm::Olm => {
                let (olm, failures) =
                    self.encrypt_olm_for_room(room_id, event_type, &content).await;
                if olm.ciphertext.is_empty() {
                    tracing::warn!(%room_id, "No recipient device for olm message, not sending");
                    return Ok(SendReport { event_id: None, algorithm, failures });
                }
                (EncryptedContent::Olm(olm), failures)
            },
            Algorithm::Megolm => {
                let (megolm, failures) =
                    self.encrypt_megolm(room_id, event_type, &content).await?;
                (EncryptedContent::Megolm(megolm), failures)
            },
        };

        let encrypted = encrypted.to_value()?;
        let event_id =
            self.transport.send_message_event(room_id, ROOM_ENCRYPTED, &encrypted).await?;

        let echo = Event::new(event_type, self.identity.user_id().clone(), content)
            .in_room(room_id.clone());
        self.echoes.insert(&encrypted, echo);

        tracing::debug!(
            %room_id,
            %algorithm,
            %event_id,
            failures = failures.len(),
            "Sent encrypted event"
        );
        Ok(SendReport { event_id: Some(event_id), algorithm, failures })
    }

    /// Send an `m.text` message.
    pub async fn send_text(
        &mut self,
        room_id: &RoomId,
        body: &str,
    ) -> Result<SendReport, MachineError> {
        let content = json!({ "msgtype": "m.text", "body": body });
        self.send_message(room_id, ROOM_MESSAGE, content).await
    }

    /// Encrypt for every device of every joined member with its own olm
    /// session.
    async fn encrypt_olm_for_room(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> (OlmContent, Vec<DeliveryFailure>) {
        let mut failures = Vec::new();
        let mut ciphertext = BTreeMap::new();
        let recipients = self.recipient_devices(room_id, &mut failures).await;
        for (user_id, device_id, device_key) in recipients {
            match self.encrypt_olm(room_id, &user_id, &device_key, event_type, content).await {
                Ok(encrypted) => {
                    ciphertext.insert(device_key, encrypted);
                },
                Err(error) => {
                    tracing::warn!(
                        %room_id,
                        %user_id,
                        %device_id,
                        %error,
                        "Cannot encrypt for device"
                    );
                    failures.push(DeliveryFailure { user_id, device_id: Some(device_id), error });
                },
            }
        }
        let sender_key = self.identity.keys().curve25519.clone();
        (OlmContent { sender_key, ciphertext }, failures)
    }

    /// Every device of every joined member of `room_id` except our own.
    ///
    /// Users whose device list cannot be fetched are recorded in `failures`
    /// and skipped.
    pub(crate) async fn recipient_devices(
        &mut self,
        room_id: &RoomId,
        failures: &mut Vec<DeliveryFailure>,
    ) -> Vec<(UserId, DeviceId, Curve25519Key)> {
        let own_key = self.identity.keys().curve25519.clone();
        let mut recipients = Vec::new();
        for user_id in self.joined_members(room_id) {
            match self.get_or_create_user(&user_id).await {
                Ok(user) => recipients.extend(
                    user.devices()
                        .filter(|device| *device.curve25519() != own_key)
                        .map(|device| {
                            let device_id = device.device_id().clone();
                            (user_id.clone(), device_id, device.curve25519().clone())
                        }),
                ),
                Err(error) => {
                    tracing::warn!(%room_id, %user_id, %error, "Device list unavailable");
                    failures.push(DeliveryFailure { user_id, device_id: None, error });
                },
            }
        }
        recipients
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_room_binds_delivery_room() {
        let forged = Event::new(ROOM_MESSAGE, UserId::from("@a:x"), json!({}))
            .in_room(RoomId::from("!other:x"));
        let forged = in_room(forged, &RoomId::from("!delivered:x"));
        assert_eq!(forged.room_id, Some(RoomId::from("!delivered:x")));

        let bare = Event::new(ROOM_MESSAGE, UserId::from("@a:x"), json!({}));
        let bare = in_room(bare, &RoomId::from("!delivered:x"));
        assert_eq!(bare.room_id, Some(RoomId::from("!delivered:x")));
    }

    #[test]
    fn report_lists_failures() {
        let ok = ProcessedEvent {
            event: Event::new(ROOM_MESSAGE, UserId::from("@a:x"), json!({})),
            decrypted: None,
            outcome: Ok(EventOutcome::Unhandled),
        };
        let bad = ProcessedEvent {
            event: Event::new(ROOM_KEY, UserId::from("@b:x"), json!({})),
            decrypted: None,
            outcome: Err(MachineError::violation("room key did not arrive over olm")),
        };
        let report = SyncReport {
            next_batch: "s1".into(),
            events: vec![ok, bad],
            one_time_keys_uploaded: 0,
        };

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0.sender, UserId::from("@b:x"));
    }
}
