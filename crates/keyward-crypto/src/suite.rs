//! Capability traits implemented by a cipher suite backend.
//!
//! The state manager is generic over [`CipherSuite`] so the ratchets can be
//! swapped (or faked) without touching session bookkeeping. Handles are
//! `Send` so a machine holding them can live behind an async mutex.

use std::collections::BTreeMap;

use keyward_proto::{Curve25519Key, Ed25519Key, OlmCiphertext, SessionId};

use crate::CryptoError;

/// The two long-term public keys of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    /// Signing key
    pub ed25519: Ed25519Key,
    /// Agreement key
    pub curve25519: Curve25519Key,
}

/// Result of creating a session from a pre-key message.
#[derive(Debug)]
pub struct InboundCreation<S> {
    /// The new session, already advanced past the pre-key message
    pub session: S,
    /// Plaintext of the pre-key message
    pub plaintext: Vec<u8>,
}

/// Plaintext recovered from a megolm message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPlaintext {
    /// Decrypted bytes
    pub plaintext: Vec<u8>,
    /// Ratchet index the message was encrypted at
    pub message_index: u32,
}

/// A device's long-term olm account.
pub trait OlmAccount: Send + 'static {
    /// Pairwise session type created by this account
    type Session: OlmSession;

    /// Public identity keys.
    fn identity_keys(&self) -> IdentityKeys;

    /// Sign `message` with the Ed25519 key, returning unpadded base64.
    fn sign(&self, message: &str) -> String;

    /// Upper bound on unpublished one-time keys the account retains.
    fn max_one_time_keys(&self) -> usize;

    /// Generate `count` fresh one-time keys.
    fn generate_one_time_keys(&mut self, count: usize);

    /// Unpublished one-time keys by key id.
    fn one_time_keys(&self) -> BTreeMap<String, Curve25519Key>;

    /// Forget the unpublished set after a successful upload.
    fn mark_keys_as_published(&mut self);

    /// Start a session towards a device using one of its one-time keys.
    fn create_outbound_session(
        &self,
        identity_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
    ) -> Result<Self::Session, CryptoError>;

    /// Accept a session from a pre-key message. Consumes the one-time key
    /// the sender used.
    fn create_inbound_session(
        &mut self,
        sender_key: &Curve25519Key,
        message: &OlmCiphertext,
    ) -> Result<InboundCreation<Self::Session>, CryptoError>;
}

/// One side of a pairwise olm session.
pub trait OlmSession: Send + 'static {
    /// Id shared by both sides.
    fn session_id(&self) -> SessionId;

    /// Encrypt, advancing the ratchet.
    fn encrypt(&mut self, plaintext: &[u8]) -> OlmCiphertext;

    /// Decrypt, advancing the ratchet on success only.
    fn decrypt(&mut self, message: &OlmCiphertext) -> Result<Vec<u8>, CryptoError>;
}

/// Sending half of a megolm session.
pub trait OutboundGroupSession: Send + 'static {
    /// Session id.
    fn session_id(&self) -> SessionId;

    /// Session key at the current ratchet index, for sharing.
    fn session_key(&self) -> String;

    /// Index the next message will be encrypted at.
    fn message_index(&self) -> u32;

    /// Encrypt, advancing the ratchet. Returns base64.
    fn encrypt(&mut self, plaintext: &[u8]) -> String;
}

/// Receiving half of a megolm session.
pub trait InboundGroupSession: Send + 'static {
    /// Session id.
    fn session_id(&self) -> SessionId;

    /// Lowest index this session can decrypt.
    fn first_known_index(&self) -> u32;

    /// True if both sessions were built from the same session key.
    fn same_key_as(&mut self, other: &mut Self) -> bool;

    /// Decrypt a base64 megolm message.
    fn decrypt(&mut self, ciphertext: &str) -> Result<GroupPlaintext, CryptoError>;
}

/// Factory and persistence for every handle type.
pub trait CipherSuite: Send + Sync + 'static {
    /// Account handle
    type Account: OlmAccount<Session = Self::Session>;
    /// Pairwise session handle
    type Session: OlmSession;
    /// Outbound group session handle
    type GroupOut: OutboundGroupSession;
    /// Inbound group session handle
    type GroupIn: InboundGroupSession;

    /// Generate a new account with fresh identity keys.
    fn create_account(&self) -> Self::Account;

    /// Start a new outbound group session.
    fn create_outbound_group_session(&self) -> Self::GroupOut;

    /// Build an inbound group session from a shared session key.
    fn create_inbound_group_session(&self, session_key: &str)
    -> Result<Self::GroupIn, CryptoError>;

    /// Check `signature` over `message` against `key`.
    fn verify_ed25519(
        &self,
        key: &Ed25519Key,
        message: &str,
        signature: &str,
    ) -> Result<(), CryptoError>;

    /// Encrypted pickle of an account.
    fn pickle_account(&self, account: &Self::Account) -> String;

    /// Restore an account.
    fn unpickle_account(&self, pickle: &str) -> Result<Self::Account, CryptoError>;

    /// Encrypted pickle of a pairwise session.
    fn pickle_session(&self, session: &Self::Session) -> String;

    /// Restore a pairwise session.
    fn unpickle_session(&self, pickle: &str) -> Result<Self::Session, CryptoError>;

    /// Encrypted pickle of an outbound group session.
    fn pickle_group_out(&self, session: &Self::GroupOut) -> String;

    /// Restore an outbound group session.
    fn unpickle_group_out(&self, pickle: &str) -> Result<Self::GroupOut, CryptoError>;

    /// Encrypted pickle of an inbound group session.
    fn pickle_group_in(&self, session: &Self::GroupIn) -> String;

    /// Restore an inbound group session.
    fn unpickle_group_in(&self, pickle: &str) -> Result<Self::GroupIn, CryptoError>;
}
