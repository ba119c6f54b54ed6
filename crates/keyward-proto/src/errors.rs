//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol decoding.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Malformed or unsupported wire content.
///
/// These are never transient: retrying the same bytes yields the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Event content did not match the expected shape
    #[error("invalid {event_type} content: {reason}")]
    InvalidContent {
        /// Event type being decoded
        event_type: String,
        /// Decoder message
        reason: String,
    },

    /// A required field was absent
    #[error("{event_type} event is missing {field}")]
    MissingField {
        /// Event type being decoded
        event_type: String,
        /// Name of the absent field
        field: &'static str,
    },

    /// Algorithm tag not understood
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Membership value outside invite/join/leave/ban
    #[error("unknown membership: {0}")]
    UnknownMembership(String),

    /// Olm ciphertext type other than pre-key (0) or normal (1)
    #[error("unknown olm message type: {0}")]
    UnknownMessageType(u64),

    /// JSON encoding failed
    #[error("json error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
