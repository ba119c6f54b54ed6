//! Identifier newtypes.
//!
//! All identifiers are opaque strings on the wire. Wrapping each kind in its
//! own type turns "passed a device id where a curve key was expected" into a
//! compile error.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume into the raw string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Fully qualified user id, e.g. `@alice:example.org`.
    UserId
);

string_id!(
    /// Device id, unique per user.
    DeviceId
);

string_id!(
    /// Room id, e.g. `!abc:example.org`.
    ///
    /// Olm sessions used for to-device traffic are indexed under a pseudo room
    /// built by [`RoomId::send_to_device`].
    RoomId
);

string_id!(
    /// Unpadded base64 Curve25519 public key (device agreement key).
    Curve25519Key
);

string_id!(
    /// Unpadded base64 Ed25519 public key (device signing key).
    Ed25519Key
);

string_id!(
    /// Olm or megolm session id as reported by the cipher suite.
    SessionId
);

/// Prefix of the pseudo room used to index to-device olm sessions.
const SEND_TO_DEVICE_PREFIX: &str = "_SendToDevice_";

impl RoomId {
    /// Pseudo room under which to-device olm sessions with `peer` are indexed.
    pub fn send_to_device(peer: &Curve25519Key) -> Self {
        Self(format!("{SEND_TO_DEVICE_PREFIX}{peer}"))
    }

    /// True for pseudo rooms created by [`RoomId::send_to_device`].
    pub fn is_send_to_device(&self) -> bool {
        self.0.starts_with(SEND_TO_DEVICE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_device_room_is_recognised() {
        let key = Curve25519Key::from("abcDEF123");
        let room = RoomId::send_to_device(&key);

        assert_eq!(room.as_str(), "_SendToDevice_abcDEF123");
        assert!(room.is_send_to_device());
        assert!(!RoomId::from("!room:example.org").is_send_to_device());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let user = UserId::from("@alice:example.org");
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"@alice:example.org\"");

        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, user);
    }
}
