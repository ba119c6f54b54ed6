//! Room and to-device events and their typed contents.
//!
//! An [`Event`] keeps its content as raw JSON. Typed views are produced on
//! demand so one malformed event only fails the consumer that asked for it.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    Algorithm, ProtocolError, Result,
    ids::{Curve25519Key, DeviceId, Ed25519Key, RoomId, SessionId, UserId},
};

/// Event type names understood by the pipeline.
pub mod event_type {
    /// Membership state event
    pub const ROOM_MEMBER: &str = "m.room.member";
    /// Room encryption algorithm state event
    pub const ROOM_ENCRYPTION: &str = "m.room.encryption";
    /// Encrypted envelope (room or to-device)
    pub const ROOM_ENCRYPTED: &str = "m.room.encrypted";
    /// Megolm session key share, only valid inside an olm envelope
    pub const ROOM_KEY: &str = "m.room_key";
    /// Room key request
    pub const ROOM_KEY_REQUEST: &str = "m.room_key_request";
    /// Forwarded room key
    pub const FORWARDED_ROOM_KEY: &str = "m.forwarded_room_key";
    /// Ordinary room message
    pub const ROOM_MESSAGE: &str = "m.room.message";
}

/// A room timeline, state, or to-device event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `m.room.message`
    #[serde(rename = "type")]
    pub event_type: String,

    /// Sending user
    pub sender: UserId,

    /// Room the event belongs to. Absent on to-device events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,

    /// State key, present on state events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,

    /// Server-assigned event id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Raw content
    #[serde(default)]
    pub content: Value,
}

impl Event {
    /// Create an event with no room, state key or id.
    pub fn new(event_type: impl Into<String>, sender: UserId, content: Value) -> Self {
        Self {
            event_type: event_type.into(),
            sender,
            room_id: None,
            state_key: None,
            event_id: None,
            content,
        }
    }

    /// Set the room id.
    #[must_use]
    pub fn in_room(mut self, room_id: RoomId) -> Self {
        self.room_id = Some(room_id);
        self
    }

    /// Set the state key.
    #[must_use]
    pub fn with_state_key(mut self, state_key: impl Into<String>) -> Self {
        self.state_key = Some(state_key.into());
        self
    }

    /// Decode the content as `T`.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.content.clone()).map_err(|e| ProtocolError::InvalidContent {
            event_type: self.event_type.clone(),
            reason: e.to_string(),
        })
    }
}

/// Room membership state of a user.
///
/// A user is in exactly one of these states per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Membership {
    /// Invited, not yet joined
    Invite,
    /// Joined
    Join,
    /// Left or kicked
    Leave,
    /// Banned
    Ban,
}

impl Membership {
    /// All states, in wire order.
    pub const ALL: [Self; 4] = [Self::Invite, Self::Join, Self::Leave, Self::Ban];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Ban => "ban",
        }
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Membership {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invite" => Ok(Self::Invite),
            "join" => Ok(Self::Join),
            "leave" => Ok(Self::Leave),
            "ban" => Ok(Self::Ban),
            other => Err(ProtocolError::UnknownMembership(other.to_string())),
        }
    }
}

impl Serialize for Membership {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Membership {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Content of `m.room.member`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberContent {
    /// New membership state
    pub membership: Membership,

    /// Display name, if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
}

/// Content of `m.room.encryption`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContent {
    /// Raw algorithm tag
    pub algorithm: String,
}

impl EncryptionContent {
    /// Content enabling `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm: algorithm.as_str().to_string() }
    }

    /// The concrete algorithm. An empty tag is unsupported here.
    pub fn algorithm(&self) -> Result<Algorithm> {
        match self.algorithm.parse()? {
            Algorithm::None => Err(ProtocolError::UnsupportedAlgorithm(self.algorithm.clone())),
            alg => Ok(alg),
        }
    }
}

/// Olm ciphertext type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OlmMessageType {
    /// First message(s) of a session, carries session setup material
    PreKey,
    /// Any later message
    Normal,
}

impl OlmMessageType {
    /// Numeric wire value.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::PreKey => 0,
            Self::Normal => 1,
        }
    }

    /// Parse the numeric wire value.
    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::PreKey),
            1 => Ok(Self::Normal),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

impl Serialize for OlmMessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.as_u64())
    }
}

impl<'de> Deserialize<'de> for OlmMessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = u64::deserialize(deserializer)?;
        Self::from_u64(raw).map_err(serde::de::Error::custom)
    }
}

/// One olm ciphertext addressed to a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertext {
    /// Pre-key or normal
    #[serde(rename = "type")]
    pub message_type: OlmMessageType,

    /// Base64 ciphertext
    pub body: String,
}

impl OlmCiphertext {
    /// True for pre-key messages.
    pub fn is_pre_key(&self) -> bool {
        self.message_type == OlmMessageType::PreKey
    }
}

/// Encrypted content using olm: one ciphertext per recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmContent {
    /// Sender's device agreement key
    pub sender_key: Curve25519Key,

    /// Ciphertexts keyed by recipient device agreement key
    pub ciphertext: BTreeMap<Curve25519Key, OlmCiphertext>,
}

/// Encrypted content using megolm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmContent {
    /// Sender's device agreement key
    pub sender_key: Curve25519Key,

    /// Base64 megolm message
    pub ciphertext: String,

    /// Outbound session the message was produced by
    pub session_id: SessionId,

    /// Sending device
    pub device_id: DeviceId,
}

/// Content of `m.room.encrypted`, discriminated by the `algorithm` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum EncryptedContent {
    /// Pairwise ciphertexts
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    Olm(OlmContent),

    /// Group ciphertext
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    Megolm(MegolmContent),
}

impl EncryptedContent {
    /// Decode from raw event content.
    ///
    /// A missing or unknown algorithm tag is reported as such rather than as
    /// a generic shape mismatch.
    pub fn parse(content: &Value) -> Result<Self> {
        let tag = content.get("algorithm").and_then(Value::as_str).ok_or_else(|| {
            ProtocolError::MissingField {
                event_type: event_type::ROOM_ENCRYPTED.to_string(),
                field: "algorithm",
            }
        })?;
        match tag.parse::<Algorithm>()? {
            Algorithm::None => Err(ProtocolError::UnsupportedAlgorithm(tag.to_string())),
            Algorithm::Olm | Algorithm::Megolm => serde_json::from_value(content.clone())
                .map_err(|e| ProtocolError::InvalidContent {
                    event_type: event_type::ROOM_ENCRYPTED.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Encode as raw event content.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// The algorithm this content was encrypted with.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Olm(_) => Algorithm::Olm,
            Self::Megolm(_) => Algorithm::Megolm,
        }
    }

    /// Sender's device agreement key.
    pub fn sender_key(&self) -> &Curve25519Key {
        match self {
            Self::Olm(content) => &content.sender_key,
            Self::Megolm(content) => &content.sender_key,
        }
    }
}

/// `{"ed25519": key}` map used inside olm payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeys {
    /// Ed25519 key
    pub ed25519: Ed25519Key,
}

/// Plaintext carried inside an olm ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OlmPayload {
    /// Inner event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Inner content
    pub content: Value,

    /// Sending user
    pub sender: UserId,

    /// Intended recipient user
    pub recipient: UserId,

    /// Signing key of the intended recipient device
    pub recipient_keys: SigningKeys,

    /// Signing key of the sending device
    pub keys: SigningKeys,

    /// Room the inner event belongs to. Omitted for to-device traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

impl OlmPayload {
    /// The inner event.
    pub fn into_event(self) -> Event {
        Event {
            event_type: self.event_type,
            sender: self.sender,
            room_id: self.room_id,
            state_key: None,
            event_id: None,
            content: self.content,
        }
    }
}

/// Plaintext carried inside a megolm ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MegolmPayload {
    /// Inner event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Inner content
    pub content: Value,

    /// Sending user
    pub sender: UserId,

    /// Room the message was sent to
    pub room_id: RoomId,
}

impl MegolmPayload {
    /// The inner event.
    pub fn into_event(self) -> Event {
        Event {
            event_type: self.event_type,
            sender: self.sender,
            room_id: Some(self.room_id),
            state_key: None,
            event_id: None,
            content: self.content,
        }
    }
}

/// Content of `m.room_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// Must be megolm
    pub algorithm: Algorithm,

    /// Room the session encrypts
    pub room_id: RoomId,

    /// Session id
    pub session_id: SessionId,

    /// Base64 session key at the sender's current ratchet index
    pub session_key: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encrypted_content_dispatches_on_algorithm() {
        let content = json!({
            "algorithm": Algorithm::MEGOLM_V1,
            "sender_key": "curve",
            "ciphertext": "AwgA",
            "session_id": "sid",
            "device_id": "DEV",
        });

        let parsed = EncryptedContent::parse(&content).unwrap();
        assert_eq!(parsed.algorithm(), Algorithm::Megolm);
        assert_eq!(parsed.sender_key().as_str(), "curve");
        assert_eq!(parsed.to_value().unwrap(), content);
    }

    #[test]
    fn encrypted_content_without_algorithm_is_missing_field() {
        let err = EncryptedContent::parse(&json!({ "sender_key": "k" })).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField { field: "algorithm", .. }));
    }

    #[test]
    fn encrypted_content_with_unknown_algorithm_is_unsupported() {
        let err = EncryptedContent::parse(&json!({ "algorithm": "m.rot13" })).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedAlgorithm("m.rot13".to_string()));
    }

    #[test]
    fn olm_message_types_use_numeric_tags() {
        let ciphertext: OlmCiphertext =
            serde_json::from_value(json!({ "type": 0, "body": "abc" })).unwrap();
        assert!(ciphertext.is_pre_key());

        let err = serde_json::from_value::<OlmCiphertext>(json!({ "type": 7, "body": "abc" }));
        assert!(err.is_err());
    }

    #[test]
    fn unknown_membership_is_rejected() {
        let event = Event::new(
            event_type::ROOM_MEMBER,
            UserId::from("@a:x"),
            json!({ "membership": "knock" }),
        );
        let err = event.content_as::<MemberContent>().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidContent { .. }));
    }

    #[test]
    fn empty_encryption_algorithm_is_unsupported() {
        let content = EncryptionContent { algorithm: String::new() };
        assert!(content.algorithm().is_err());
        assert_eq!(EncryptionContent::new(Algorithm::Olm).algorithm().unwrap(), Algorithm::Olm);
    }

    #[test]
    fn olm_payload_omits_room_for_to_device() {
        let payload = OlmPayload {
            event_type: event_type::ROOM_KEY.to_string(),
            content: json!({}),
            sender: UserId::from("@a:x"),
            recipient: UserId::from("@b:x"),
            recipient_keys: SigningKeys { ed25519: Ed25519Key::from("bk") },
            keys: SigningKeys { ed25519: Ed25519Key::from("ak") },
            room_id: None,
        };

        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("room_id").is_none());
        assert_eq!(payload.into_event().room_id, None);
    }
}
