//! Error types for the crypto state manager.
//!
//! [`MachineError`] is what every machine operation returns. Callers decide
//! what to do with a failure through [`MachineError::class`], which sorts
//! errors into the handful of recovery strategies a client actually has:
//! retry later, ask for keys again, wait for a room key, drop the event, or
//! give up.

use keyward_crypto::CryptoError;
use keyward_proto::{Algorithm, Curve25519Key, DeviceId, ProtocolError, RoomId, SessionId, UserId};
use thiserror::Error;

use crate::{store::StorageError, transport::TransportError};

/// Recovery strategy for a [`MachineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network hiccup; the same call may succeed later
    Transient,
    /// The remote device has no one-time key left to claim
    KeyUnavailable,
    /// A session or room key has not arrived yet; later events may fix it
    SessionMissing,
    /// Malformed, misaddressed or undecryptable input; drop the event
    ProtocolViolation,
    /// Room already uses a different algorithm
    AlgorithmConflict,
    /// Local failure (storage, pickling, rejected request)
    Fatal,
}

/// Errors returned by machine operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// Homeserver call failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Persistent store failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cipher suite rejected the operation
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Event content could not be decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Claim returned no usable one-time key for the device
    #[error("no one-time key available for {user_id} device {device_id}")]
    KeyUnavailable {
        /// Owner of the device
        user_id: UserId,
        /// Device we tried to reach
        device_id: DeviceId,
    },

    /// No device of the user has this agreement key
    #[error("unknown device {device_key} of {user_id}")]
    UnknownDevice {
        /// Claimed owner
        user_id: UserId,
        /// Agreement key the sender used
        device_key: Curve25519Key,
    },

    /// Normal olm message arrived but no session is stored for the sender
    #[error("no olm session stored for {user_id} key {device_key}")]
    NoOlmSession {
        /// Sender
        user_id: UserId,
        /// Sender's agreement key
        device_key: Curve25519Key,
    },

    /// Megolm message for a session we have no key for
    #[error("haven't received room key yet for session {session_id} in {room_id}")]
    SessionMissing {
        /// Room the message was sent in
        room_id: RoomId,
        /// Session the message was encrypted with
        session_id: SessionId,
    },

    /// Room key for a known session id with a different key
    #[error("inbound group session {session_id} already exists with a different key")]
    SessionKeyConflict {
        /// Conflicting session id
        session_id: SessionId,
    },

    /// Room already has a different algorithm set
    #[error("room {room_id} already uses {current}, cannot switch to {requested}")]
    AlgorithmConflict {
        /// Room
        room_id: RoomId,
        /// Algorithm in effect
        current: Algorithm,
        /// Algorithm that was asked for
        requested: Algorithm,
    },

    /// Device keys or one-time key failed signature verification
    #[error("invalid signature from {user_id} device {device_id}")]
    InvalidSignature {
        /// Signing user
        user_id: UserId,
        /// Signing device
        device_id: DeviceId,
    },

    /// Echo of our own ciphertext that is no longer cached
    #[error("own ciphertext is not in the echo cache")]
    OwnMessageNotCached,

    /// Event is well-formed JSON but breaks a protocol rule
    #[error("protocol violation: {0}")]
    Violation(String),
}

impl MachineError {
    /// Recovery strategy for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Transport(err) if err.is_transient() => ErrorClass::Transient,
            Self::Transport(_) | Self::Storage(_) => ErrorClass::Fatal,
            Self::Crypto(CryptoError::Pickle(_) | CryptoError::KeyDerivation(_)) => {
                ErrorClass::Fatal
            },
            Self::Crypto(_)
            | Self::Protocol(_)
            | Self::SessionKeyConflict { .. }
            | Self::InvalidSignature { .. }
            | Self::Violation(_) => ErrorClass::ProtocolViolation,
            Self::KeyUnavailable { .. } => ErrorClass::KeyUnavailable,
            Self::UnknownDevice { .. }
            | Self::NoOlmSession { .. }
            | Self::SessionMissing { .. }
            | Self::OwnMessageNotCached => ErrorClass::SessionMissing,
            Self::AlgorithmConflict { .. } => ErrorClass::AlgorithmConflict,
        }
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub(crate) fn violation(reason: impl Into<String>) -> Self {
        Self::Violation(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_class_follows_transience() {
        let timeout = MachineError::from(TransportError::Timeout);
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert!(timeout.is_transient());

        let forbidden =
            MachineError::from(TransportError::Server { status: 403, message: String::new() });
        assert_eq!(forbidden.class(), ErrorClass::Fatal);
    }

    #[test]
    fn pickle_failures_are_fatal_but_bad_ciphertext_is_not() {
        let pickle = MachineError::from(CryptoError::Pickle("wrong key".into()));
        assert_eq!(pickle.class(), ErrorClass::Fatal);

        let garbage = MachineError::from(CryptoError::Decryption("mac".into()));
        assert_eq!(garbage.class(), ErrorClass::ProtocolViolation);
    }

    #[test]
    fn missing_room_key_is_recoverable() {
        let err = MachineError::SessionMissing {
            room_id: RoomId::from("!r:x"),
            session_id: SessionId::from("s"),
        };
        assert_eq!(err.class(), ErrorClass::SessionMissing);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("haven't received room key yet"));
    }
}
