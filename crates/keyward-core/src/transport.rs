//! Homeserver transport abstraction.
//!
//! The machine never speaks HTTP itself. Everything it needs from the server
//! (device queries, key claims and uploads, sends and the long-poll) goes
//! through [`Transport`], which production code backs with a real client and
//! tests back with an in-memory homeserver.

use std::{future::Future, time::Duration};

use keyward_proto::{
    KeysClaimRequest, KeysClaimResponse, KeysQueryResponse, KeysUploadRequest, KeysUploadResponse,
    RoomId, SyncResponse, ToDeviceMessages, UserId,
};
use serde_json::Value;
use thiserror::Error;

/// Errors reported by a transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established or was lost
    #[error("network error: {0}")]
    Network(String),

    /// Request did not complete in time
    #[error("request timed out")]
    Timeout,

    /// Server asked us to slow down
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Server-suggested delay
        retry_after_ms: u64,
    },

    /// Server answered with an error status
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Error body
        message: String,
    },
}

impl TransportError {
    /// Returns true if the request may succeed on retry.
    ///
    /// Client errors (4xx other than rate limiting) are permanent: the same
    /// request will be rejected again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::RateLimited { .. } => true,
            Self::Server { status, .. } => *status >= 500,
        }
    }
}

/// Homeserver operations used by the machine.
///
/// Implementations are shared between the machine and the sync driver, so
/// every method takes `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Fetch device key bundles for `users`.
    fn query_keys(
        &self,
        users: &[UserId],
    ) -> impl Future<Output = Result<KeysQueryResponse, TransportError>> + Send;

    /// Claim one-time keys.
    fn claim_keys(
        &self,
        request: &KeysClaimRequest,
    ) -> impl Future<Output = Result<KeysClaimResponse, TransportError>> + Send;

    /// Publish device keys and one-time keys.
    fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> impl Future<Output = Result<KeysUploadResponse, TransportError>> + Send;

    /// Deliver per-device payloads of one event type.
    fn send_to_device(
        &self,
        event_type: &str,
        messages: &ToDeviceMessages,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send a state event. Returns the event id.
    fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Send a timeline event. Returns the event id.
    fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Long-poll for the next batch after `since`.
    fn sync(
        &self,
        since: Option<&str>,
        timeout: Duration,
    ) -> impl Future<Output = Result<SyncResponse, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        assert!(TransportError::Network("reset".into()).is_transient());
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::RateLimited { retry_after_ms: 100 }.is_transient());
        assert!(TransportError::Server { status: 502, message: String::new() }.is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let forbidden = TransportError::Server { status: 403, message: "forbidden".into() };
        assert!(!forbidden.is_transient());
        assert!(!TransportError::Server { status: 400, message: String::new() }.is_transient());
    }
}
