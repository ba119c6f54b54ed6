//! Group (megolm) session manager.
//!
//! Outbound: one session per room, created lazily, shared with each
//! recipient device exactly once over olm as an `m.room_key`, and rotated
//! only on request. Inbound: sessions are keyed by the sender device and
//! session id, and the session index names the current one per
//! (room, sender, sender key).
//!
//! # Invariants
//!
//! - A room has at most one outbound session at a time.
//! - A device is marked as having received a session only after the
//!   to-device send carrying the key succeeded.
//! - An inbound session id is bound to one session key; a second key for the
//!   same id is rejected.

use std::collections::BTreeMap;

use keyward_crypto::{CipherSuite, GroupPlaintext, InboundGroupSession, OutboundGroupSession};
use keyward_proto::{
    Algorithm, Curve25519Key, DeviceId, EncryptedContent, Event, MegolmContent, MegolmPayload,
    OlmContent, ProtocolError, RoomId, RoomKeyContent, SessionId, ToDeviceMessages, UserId,
    event_type::{ROOM_ENCRYPTED, ROOM_KEY},
};
use serde_json::Value;

use crate::{
    env::Environment, error::MachineError, index::Triplet, machine::CryptoMachine,
    pipeline::DeliveryFailure, store::Storage, transport::Transport,
};

/// A device a room key is about to be sent to.
struct KeyDelivery {
    user_id: UserId,
    device_id: DeviceId,
    device_key: Curve25519Key,
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Id of our outbound session in `room_id`, creating and persisting a
    /// new one if there is none.
    pub fn get_or_create_room_session(
        &mut self,
        room_id: &RoomId,
    ) -> Result<SessionId, MachineError> {
        if let Some(session) = self.outbound.get(room_id) {
            return Ok(session.session_id());
        }

        let session = self.suite.create_outbound_group_session();
        let pickle = self.suite.pickle_group_out(&session);
        self.store.store_megolm_out(
            self.identity.user_id(),
            self.identity.device_id(),
            room_id,
            &pickle,
        )?;

        let session_id = session.session_id();
        tracing::info!(%room_id, %session_id, "Created outbound group session");
        self.outbound.insert(room_id.clone(), session);
        Ok(session_id)
    }

    /// Discard the outbound session of `room_id`. The next send creates and
    /// shares a fresh one.
    ///
    /// Returns the id of the discarded session, if there was one.
    pub fn rotate_room_session(
        &mut self,
        room_id: &RoomId,
    ) -> Result<Option<SessionId>, MachineError> {
        if !self.outbound.contains_key(room_id) {
            return Ok(None);
        }
        self.store.remove_megolm_out(self.identity.user_id(), self.identity.device_id(), room_id)?;

        let previous = self.outbound.remove(room_id);
        let previous = previous.as_ref().map(OutboundGroupSession::session_id);
        tracing::info!(%room_id, session_id = ?previous, "Rotated outbound group session");
        Ok(previous)
    }

    /// Send the room's current session key to every device of every joined
    /// member that has not received it yet.
    ///
    /// Device lists are fetched as needed. All keys go out in one to-device
    /// request. Per-user and per-device failures are collected rather than
    /// aborting the share; only local failures (store, encoding) return
    /// `Err`.
    pub async fn share_room_key(
        &mut self,
        room_id: &RoomId,
    ) -> Result<Vec<DeliveryFailure>, MachineError> {
        let session_id = self.get_or_create_room_session(room_id)?;
        let session_key = self
            .outbound
            .get(room_id)
            .map(OutboundGroupSession::session_key)
            .ok_or_else(|| MachineError::violation("room has no outbound session"))?;
        let content = serde_json::to_value(RoomKeyContent {
            algorithm: Algorithm::Megolm,
            room_id: room_id.clone(),
            session_id: session_id.clone(),
            session_key,
        })
        .map_err(ProtocolError::from)?;

        let mut failures = Vec::new();
        let pending: Vec<KeyDelivery> = self
            .recipient_devices(room_id, &mut failures)
            .await
            .into_iter()
            .filter(|(user_id, _, device_key)| {
                self.directory
                    .lookup(user_id, device_key)
                    .is_some_and(|device| !device.has_received(&session_id))
            })
            .map(|(user_id, device_id, device_key)| KeyDelivery { user_id, device_id, device_key })
            .collect();
        if pending.is_empty() {
            return Ok(failures);
        }

        let own_key = self.identity.keys().curve25519.clone();
        let mut messages = ToDeviceMessages::new();
        let mut sent = Vec::new();
        for delivery in pending {
            let pseudo_room = RoomId::send_to_device(&delivery.device_key);
            let KeyDelivery { user_id, device_id, device_key } = &delivery;
            let ciphertext = match self
                .encrypt_olm(&pseudo_room, user_id, device_key, ROOM_KEY, &content)
                .await
            {
                Ok(ciphertext) => ciphertext,
                Err(error) => {
                    tracing::warn!(%room_id, %user_id, %device_id, %error, "Cannot share room key");
                    failures.push(DeliveryFailure {
                        user_id: user_id.clone(),
                        device_id: Some(device_id.clone()),
                        error,
                    });
                    continue;
                },
            };
            let envelope = EncryptedContent::Olm(OlmContent {
                sender_key: own_key.clone(),
                ciphertext: BTreeMap::from([(device_key.clone(), ciphertext)]),
            })
            .to_value()?;
            messages.entry(user_id.clone()).or_default().insert(device_id.clone(), envelope);
            sent.push(delivery);
        }
        if sent.is_empty() {
            return Ok(failures);
        }

        if let Err(error) = self.transport.send_to_device(ROOM_ENCRYPTED, &messages).await {
            let error = MachineError::from(error);
            tracing::warn!(%room_id, devices = sent.len(), %error, "Room key delivery failed");
            failures.extend(sent.into_iter().map(|delivery| DeliveryFailure {
                user_id: delivery.user_id,
                device_id: Some(delivery.device_id),
                error: error.clone(),
            }));
            return Ok(failures);
        }

        for KeyDelivery { user_id, device_id, device_key } in &sent {
            self.store.mark_megolm_shared(user_id, device_id, &session_id)?;
            if let Some(device) = self.directory.lookup_mut(user_id, device_key) {
                device.shared_megolm.insert(session_id.clone());
            }
        }
        tracing::debug!(%room_id, %session_id, devices = sent.len(), "Shared room key");
        Ok(failures)
    }

    /// Encrypt an event with the room's group session, sharing the session
    /// key first with any member device that lacks it.
    pub async fn encrypt_megolm(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<(MegolmContent, Vec<DeliveryFailure>), MachineError> {
        let failures = self.share_room_key(room_id).await?;

        let payload = MegolmPayload {
            event_type: event_type.to_string(),
            content: content.clone(),
            sender: self.identity.user_id().clone(),
            room_id: room_id.clone(),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(ProtocolError::from)?;

        let Some(session) = self.outbound.get_mut(room_id) else {
            return Err(MachineError::violation("room has no outbound session"));
        };
        let ciphertext = session.encrypt(&plaintext);
        let session_id = session.session_id();
        let pickle = self.suite.pickle_group_out(session);
        self.store.store_megolm_out(
            self.identity.user_id(),
            self.identity.device_id(),
            room_id,
            &pickle,
        )?;

        let content = MegolmContent {
            sender_key: self.identity.keys().curve25519.clone(),
            ciphertext,
            session_id,
            device_id: self.identity.device_id().clone(),
        };
        Ok((content, failures))
    }

    /// Install a received session key as an inbound group session of the
    /// sender device.
    ///
    /// Installing the same key twice is a no-op. A different key under an
    /// existing session id fails with
    /// [`SessionKeyConflict`](MachineError::SessionKeyConflict) and keeps the
    /// original.
    pub fn install_inbound(
        &mut self,
        user_id: &UserId,
        device_key: &Curve25519Key,
        session_id: &SessionId,
        session_key: &str,
    ) -> Result<(), MachineError> {
        let mut session = self.suite.create_inbound_group_session(session_key)?;
        if session.session_id() != *session_id {
            return Err(MachineError::violation("room key session id does not match its key"));
        }

        let device = self.directory.lookup_mut(user_id, device_key).ok_or_else(|| {
            MachineError::UnknownDevice { user_id: user_id.clone(), device_key: device_key.clone() }
        })?;
        if let Some(existing) = device.megolm_sessions.get_mut(session_id) {
            if existing.same_key_as(&mut session) {
                tracing::debug!(%user_id, %session_id, "Inbound group session already installed");
                return Ok(());
            }
            tracing::warn!(%user_id, %session_id, "Room key conflicts with installed session");
            return Err(MachineError::SessionKeyConflict { session_id: session_id.clone() });
        }

        let pickle = self.suite.pickle_group_in(&session);
        self.store.store_megolm_in(user_id, device.device_id(), session_id, &pickle)?;
        device.megolm_sessions.insert(session_id.clone(), session);
        Ok(())
    }

    /// Accept an `m.room_key` that arrived over olm from `sender`.
    ///
    /// Installs the session and points the (room, sender, sender key)
    /// triplet at it.
    pub(crate) fn accept_room_key(
        &mut self,
        sender: &UserId,
        sender_key: &Curve25519Key,
        content: &RoomKeyContent,
    ) -> Result<(), MachineError> {
        if content.algorithm != Algorithm::Megolm {
            return Err(MachineError::violation("room key is not for megolm"));
        }
        self.install_inbound(sender, sender_key, &content.session_id, &content.session_key)?;

        let triplet = Triplet::new(content.room_id.clone(), sender.clone(), sender_key.clone());
        self.store.store_megolm_session_id(&triplet, &content.session_id)?;
        self.index.set_megolm(triplet, content.session_id.clone());
        tracing::info!(
            room_id = %content.room_id,
            %sender,
            session_id = %content.session_id,
            "Installed room key"
        );
        Ok(())
    }

    /// Decrypt a megolm event and return the inner event with its ratchet
    /// index.
    ///
    /// Fails with [`SessionMissing`](MachineError::SessionMissing) until the
    /// room key for the session has arrived.
    pub async fn decrypt_megolm(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        content: &MegolmContent,
    ) -> Result<(Event, u32), MachineError> {
        self.ensure_device(sender, &content.sender_key).await?;

        let missing = || MachineError::SessionMissing {
            room_id: room_id.clone(),
            session_id: content.session_id.clone(),
        };
        let triplet = Triplet::new(room_id.clone(), sender.clone(), content.sender_key.clone());
        if self.index.megolm(&triplet).is_none() {
            return Err(missing());
        }

        let device = self.directory.lookup_mut(sender, &content.sender_key).ok_or_else(|| {
            MachineError::UnknownDevice {
                user_id: sender.clone(),
                device_key: content.sender_key.clone(),
            }
        })?;
        let session = device.megolm_sessions.get_mut(&content.session_id).ok_or_else(missing)?;
        let GroupPlaintext { plaintext, message_index } = session.decrypt(&content.ciphertext)?;
        let pickle = self.suite.pickle_group_in(session);
        self.store.store_megolm_in(sender, device.device_id(), &content.session_id, &pickle)?;

        let payload: MegolmPayload =
            serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::InvalidContent {
                event_type: ROOM_ENCRYPTED.to_string(),
                reason: e.to_string(),
            })?;
        if payload.room_id != *room_id {
            return Err(MachineError::violation("megolm payload names another room"));
        }
        if payload.sender != *sender {
            return Err(MachineError::violation("megolm payload sender does not match event"));
        }
        Ok((payload.into_event(), message_index))
    }
}
