//! Pairwise (olm) session manager.
//!
//! Each (room, user, device key) triplet moves from no session to an
//! established one, either outbound (we claim one of the device's one-time
//! keys) or inbound (the device sent us a pre-key message). Sessions live on
//! the [`RemoteDevice`](crate::RemoteDevice) by id; the session index names
//! the current one per triplet.
//!
//! # Invariants
//!
//! - A session is stored on its device and pointed to by the index before it
//!   is used.
//! - Every successful encrypt or decrypt writes the advanced session back.
//! - A decrypted payload is only accepted if it names us as recipient and
//!   the sender device's signing key as its origin.

use std::collections::BTreeMap;

use keyward_crypto::{CipherSuite, InboundCreation, OlmAccount, OlmSession};
use keyward_proto::{
    Curve25519Key, Ed25519Key, Event, KeysClaimRequest, OlmCiphertext, OlmContent, OlmPayload,
    ProtocolError, RoomId, SIGNED_CURVE25519, SessionId, SigningKeys, UserId, event_type,
};
use serde_json::Value;

use crate::{
    env::Environment, error::MachineError, index::Triplet, machine::CryptoMachine,
    store::Storage, transport::Transport,
};

/// Who we are, as an olm payload must name us.
struct Recipient<'a> {
    user_id: &'a UserId,
    ed25519: &'a Ed25519Key,
}

/// Check a decrypted olm payload against the envelope it arrived in.
///
/// `room_id` is where the envelope was received; for to-device traffic it is
/// the sender's pseudo room and the payload carries no room.
fn check_payload(
    payload: &OlmPayload,
    room_id: &RoomId,
    sender: &UserId,
    sender_ed25519: &Ed25519Key,
    us: &Recipient<'_>,
) -> Result<(), MachineError> {
    if payload.sender != *sender {
        return Err(MachineError::violation("olm payload sender does not match event sender"));
    }
    if payload.recipient != *us.user_id {
        return Err(MachineError::violation("olm payload is addressed to another user"));
    }
    if payload.recipient_keys.ed25519 != *us.ed25519 {
        return Err(MachineError::violation("olm payload is addressed to another device"));
    }
    if payload.keys.ed25519 != *sender_ed25519 {
        return Err(MachineError::violation("olm payload signing key does not match sender"));
    }
    match &payload.room_id {
        Some(inner) if !room_id.is_send_to_device() && inner != room_id => {
            Err(MachineError::violation("olm payload names another room"))
        },
        _ => Ok(()),
    }
}

fn unknown_device(user_id: &UserId, key: &Curve25519Key) -> MachineError {
    MachineError::UnknownDevice { user_id: user_id.clone(), device_key: key.clone() }
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Current pairwise session for the triplet, established by claiming one
    /// of the device's one-time keys if there is none.
    ///
    /// The device must already be in the directory. A claim that returns no
    /// `signed_curve25519` key fails with
    /// [`KeyUnavailable`](MachineError::KeyUnavailable).
    pub async fn ensure_olm_session(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        device_key: &Curve25519Key,
    ) -> Result<SessionId, MachineError> {
        let triplet = Triplet::new(room_id.clone(), user_id.clone(), device_key.clone());
        let device = self.lookup_device(user_id, device_key)?;
        if let Some(session_id) = self.index.olm(&triplet) {
            if device.olm_sessions.contains_key(session_id) {
                return Ok(session_id.clone());
            }
            tracing::warn!(%room_id, %user_id, %session_id, "Indexed olm session missing");
        }
        let device_id = device.device_id().clone();
        let ed25519 = device.ed25519().clone();

        let request: KeysClaimRequest = BTreeMap::from([(
            user_id.clone(),
            BTreeMap::from([(device_id.clone(), SIGNED_CURVE25519.to_string())]),
        )]);
        let response = self.transport.claim_keys(&request).await?;
        let Some((key_id, one_time_key)) = response.signed_key(user_id, &device_id)? else {
            return Err(MachineError::KeyUnavailable { user_id: user_id.clone(), device_id });
        };

        let invalid = || MachineError::InvalidSignature {
            user_id: user_id.clone(),
            device_id: device_id.clone(),
        };
        let signature = one_time_key.signature_by(user_id, &device_id).ok_or_else(invalid)?;
        self.suite
            .verify_ed25519(&ed25519, &one_time_key.signable()?, signature)
            .map_err(|_| invalid())?;

        let session =
            self.identity.account.create_outbound_session(device_key, &one_time_key.key)?;
        tracing::debug!(%room_id, %user_id, %device_id, %key_id, "Claimed one-time key");
        self.install_olm_session(triplet, session)
    }

    /// Encrypt an event for one device, establishing a session if needed.
    ///
    /// The payload names `room_id` unless it is a send-to-device pseudo room.
    pub async fn encrypt_olm(
        &mut self,
        room_id: &RoomId,
        user_id: &UserId,
        device_key: &Curve25519Key,
        event_type: &str,
        content: &Value,
    ) -> Result<OlmCiphertext, MachineError> {
        let session_id = self.ensure_olm_session(room_id, user_id, device_key).await?;

        let device = self
            .directory
            .lookup_mut(user_id, device_key)
            .ok_or_else(|| unknown_device(user_id, device_key))?;
        let payload = OlmPayload {
            event_type: event_type.to_string(),
            content: content.clone(),
            sender: self.identity.user_id().clone(),
            recipient: user_id.clone(),
            recipient_keys: SigningKeys { ed25519: device.ed25519().clone() },
            keys: self.identity.signing_keys(),
            room_id: (!room_id.is_send_to_device()).then(|| room_id.clone()),
        };
        let plaintext = serde_json::to_vec(&payload).map_err(ProtocolError::from)?;

        let Some(session) = device.olm_sessions.get_mut(&session_id) else {
            return Err(MachineError::NoOlmSession {
                user_id: user_id.clone(),
                device_key: device_key.clone(),
            });
        };
        let ciphertext = session.encrypt(&plaintext);
        let pickle = self.suite.pickle_session(session);
        self.store.store_olm_session(user_id, device.device_id(), &session_id, &pickle)?;
        Ok(ciphertext)
    }

    /// Decrypt our ciphertext from an olm envelope and return the inner
    /// event.
    ///
    /// `room_id` is the room the envelope arrived in, or the sender's
    /// send-to-device pseudo room. A pre-key message with no usable session
    /// creates a new inbound session; a normal message with no session fails
    /// with [`NoOlmSession`](MachineError::NoOlmSession).
    pub async fn decrypt_olm(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        content: &OlmContent,
    ) -> Result<Event, MachineError> {
        let Some(ciphertext) = content.ciphertext.get(&self.identity.keys().curve25519) else {
            return Err(MachineError::violation("olm event has no ciphertext for this device"));
        };
        let ciphertext = ciphertext.clone();
        let sender_key = &content.sender_key;

        self.ensure_device(sender, sender_key).await?;
        let triplet = Triplet::new(room_id.clone(), sender.clone(), sender_key.clone());

        let plaintext = match self.decrypt_with_current(&triplet, &ciphertext)? {
            Some(plaintext) => plaintext,
            None if ciphertext.is_pre_key() => self.accept_pre_key(triplet, &ciphertext)?,
            None => {
                return Err(MachineError::NoOlmSession {
                    user_id: sender.clone(),
                    device_key: sender_key.clone(),
                });
            },
        };

        let payload: OlmPayload =
            serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::InvalidContent {
                event_type: event_type::ROOM_ENCRYPTED.to_string(),
                reason: e.to_string(),
            })?;
        let sender_ed25519 = self.lookup_device(sender, sender_key)?.ed25519();
        let us = Recipient { user_id: self.identity.user_id(), ed25519: self.identity.ed25519() };
        check_payload(&payload, room_id, sender, sender_ed25519, &us)?;

        let mut event = payload.into_event();
        if event.room_id.is_none() && !room_id.is_send_to_device() {
            event.room_id = Some(room_id.clone());
        }
        Ok(event)
    }

    /// Try the triplet's current session.
    ///
    /// `Ok(None)` means there is no session, or the current one failed on a
    /// pre-key message and a new inbound session should be tried.
    fn decrypt_with_current(
        &mut self,
        triplet: &Triplet,
        ciphertext: &OlmCiphertext,
    ) -> Result<Option<Vec<u8>>, MachineError> {
        let Some(session_id) = self.index.olm(triplet).cloned() else {
            return Ok(None);
        };
        let device = self
            .directory
            .lookup_mut(&triplet.user_id, &triplet.device_key)
            .ok_or_else(|| unknown_device(&triplet.user_id, &triplet.device_key))?;
        let Some(session) = device.olm_sessions.get_mut(&session_id) else {
            tracing::warn!(%session_id, "Indexed olm session missing");
            return Ok(None);
        };

        match session.decrypt(ciphertext) {
            Ok(plaintext) => {
                let pickle = self.suite.pickle_session(session);
                let device_id = device.device_id();
                self.store.store_olm_session(&triplet.user_id, device_id, &session_id, &pickle)?;
                Ok(Some(plaintext))
            },
            Err(err) if ciphertext.is_pre_key() => {
                tracing::debug!(%session_id, error = %err, "Pre-key message for a new session");
                Ok(None)
            },
            Err(err) => Err(err.into()),
        }
    }

    /// Create an inbound session from a pre-key message.
    fn accept_pre_key(
        &mut self,
        triplet: Triplet,
        ciphertext: &OlmCiphertext,
    ) -> Result<Vec<u8>, MachineError> {
        let InboundCreation { session, plaintext } =
            self.identity.account.create_inbound_session(&triplet.device_key, ciphertext)?;
        tracing::debug!(
            room_id = %triplet.room_id,
            user_id = %triplet.user_id,
            session_id = %session.session_id(),
            "Accepted inbound olm session"
        );
        self.install_olm_session(triplet, session)?;
        // The one-time key is gone from the account now.
        self.persist_account()?;
        Ok(plaintext)
    }

    /// Store a new session on its device and point the triplet at it.
    fn install_olm_session(
        &mut self,
        triplet: Triplet,
        session: C::Session,
    ) -> Result<SessionId, MachineError> {
        let session_id = session.session_id();
        let device = self
            .directory
            .lookup_mut(&triplet.user_id, &triplet.device_key)
            .ok_or_else(|| unknown_device(&triplet.user_id, &triplet.device_key))?;

        let pickle = self.suite.pickle_session(&session);
        self.store.store_olm_session(&triplet.user_id, device.device_id(), &session_id, &pickle)?;
        self.store.store_olm_session_id(&triplet, &session_id)?;

        device.olm_sessions.insert(session_id.clone(), session);
        self.index.set_olm(triplet, session_id.clone());
        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use keyward_proto::event_type::ROOM_MESSAGE;
    use serde_json::json;

    use super::*;

    fn payload(room_id: Option<&str>) -> OlmPayload {
        OlmPayload {
            event_type: ROOM_MESSAGE.to_string(),
            content: json!({ "body": "hello" }),
            sender: UserId::from("@alice:x"),
            recipient: UserId::from("@bob:x"),
            recipient_keys: SigningKeys { ed25519: Ed25519Key::from("bob-ed") },
            keys: SigningKeys { ed25519: Ed25519Key::from("alice-ed") },
            room_id: room_id.map(RoomId::from),
        }
    }

    fn check(payload: &OlmPayload, room: &RoomId) -> Result<(), MachineError> {
        let bob = UserId::from("@bob:x");
        let bob_ed = Ed25519Key::from("bob-ed");
        let us = Recipient { user_id: &bob, ed25519: &bob_ed };
        check_payload(payload, room, &UserId::from("@alice:x"), &Ed25519Key::from("alice-ed"), &us)
    }

    #[test]
    fn well_addressed_payload_is_accepted() {
        let room = RoomId::from("!r:x");
        check(&payload(Some("!r:x")), &room).unwrap();
        check(&payload(None), &RoomId::send_to_device(&Curve25519Key::from("k"))).unwrap();
    }

    #[test]
    fn misaddressed_payloads_are_violations() {
        let room = RoomId::from("!r:x");

        let mut other_user = payload(Some("!r:x"));
        other_user.recipient = UserId::from("@carol:x");
        let mut other_device = payload(Some("!r:x"));
        other_device.recipient_keys.ed25519 = Ed25519Key::from("carol-ed");
        let mut forged = payload(Some("!r:x"));
        forged.keys.ed25519 = Ed25519Key::from("mallory-ed");
        let mut spoofed = payload(Some("!r:x"));
        spoofed.sender = UserId::from("@mallory:x");

        for bad in [other_user, other_device, forged, spoofed, payload(Some("!other:x"))] {
            let err = check(&bad, &room).unwrap_err();
            assert_eq!(err.class(), crate::ErrorClass::ProtocolViolation, "{err}");
        }
    }
}
