//! Cipher suite error types.

use thiserror::Error;

/// Errors reported by a cipher suite.
///
/// None of these are transient. A ciphertext that fails once fails forever
/// against the same session state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A public key could not be decoded
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A ciphertext could not be decoded
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Authentication or ratchet mismatch while decrypting
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// A pre-key message did not yield a session
    #[error("session creation failed: {0}")]
    SessionCreation(String),

    /// Pickle could not be decrypted or decoded
    #[error("pickle error: {0}")]
    Pickle(String),

    /// Signature did not verify
    #[error("signature error: {0}")]
    Signature(String),

    /// Pickle key derivation failed
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
}
