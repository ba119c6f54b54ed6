//! Keyward wire types
//!
//! Typed representations of the JSON documents exchanged with a Matrix-style
//! homeserver: identifiers, encryption algorithms, room and to-device events,
//! device key bundles, one-time key claims and sync batches.
//!
//! Identifiers are newtypes so a device id can never be passed where a
//! Curve25519 key is expected. Event content stays an opaque
//! [`serde_json::Value`] until a consumer asks for a typed view with
//! [`Event::content_as`]; malformed content surfaces as a [`ProtocolError`]
//! rather than failing the whole event decode.
//!
//! # Invariants
//!
//! - Every algorithm string accepted from the wire maps to exactly one
//!   [`Algorithm`] variant; anything else is rejected.
//! - Canonical JSON (used for signatures) is produced by one function,
//!   [`canonical_json`], so signers and verifiers agree byte-for-byte.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod algorithm;
mod errors;
mod events;
mod ids;
mod keys;
mod sync;

pub use algorithm::{Algorithm, SIGNED_CURVE25519};
pub use errors::{ProtocolError, Result};
pub use events::{
    EncryptedContent, EncryptionContent, Event, MegolmContent, MegolmPayload, MemberContent,
    Membership, OlmCiphertext, OlmContent, OlmMessageType, OlmPayload, RoomKeyContent,
    SigningKeys, event_type,
};
pub use ids::{Curve25519Key, DeviceId, Ed25519Key, RoomId, SessionId, UserId};
pub use keys::{
    DeviceKeys, KeysClaimRequest, KeysClaimResponse, KeysQueryResponse, KeysUploadRequest,
    KeysUploadResponse, OneTimeKey, Signatures, canonical_json,
};
pub use sync::{
    DeviceLists, InviteState, InvitedRoom, JoinedRoom, LeftRoom, RoomEvents, Rooms, SyncResponse,
    Timeline, ToDevice, ToDeviceEvent, ToDeviceMessages,
};
