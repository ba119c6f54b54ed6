//! Key used to encrypt pickles at rest.

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// HKDF salt for passphrase-derived pickle keys.
const PICKLE_KEY_SALT: &[u8] = b"keyward pickle key v1";

/// HKDF info for passphrase-derived pickle keys.
const PICKLE_KEY_INFO: &[u8] = b"pickle";

/// 32-byte symmetric key protecting every stored pickle.
///
/// Zeroized on drop. Never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PickleKey([u8; 32]);

impl PickleKey {
    /// Use raw key bytes as-is.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a key from an arbitrary-length secret (passphrase, keyring
    /// entry) with HKDF-SHA256.
    pub fn derive(secret: &[u8]) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(PICKLE_KEY_SALT), secret);
        let mut key = [0u8; 32];
        hkdf.expand(PICKLE_KEY_INFO, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PickleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PickleKey(..)")
    }
}
