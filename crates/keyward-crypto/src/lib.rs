//! Keyward Cipher Suite
//!
//! The ratchet math behind keyward's session managers, exposed as a small set
//! of capability traits. The state manager never touches key material
//! directly: it holds opaque account and session handles, asks them to
//! encrypt or decrypt, and persists them as pickles.
//!
//! # Capabilities
//!
//! ```text
//! CipherSuite
//!    │
//!    ├── Account ──► identity keys, signatures, one-time keys
//!    │      │
//!    │      ▼
//!    │   Session (olm) ──► pairwise encrypt / decrypt
//!    │
//!    ├── GroupOut (megolm, ours) ──► encrypt, export session key
//!    │
//!    └── GroupIn (megolm, theirs) ──► decrypt with message index
//! ```
//!
//! Every handle round-trips through an encrypted pickle string so the store
//! only ever sees ciphertext.
//!
//! # Security
//!
//! - Pickles are encrypted with a [`PickleKey`] that is zeroized on drop.
//! - Device bundles and one-time keys are verified with
//!   [`CipherSuite::verify_ed25519`] before they are trusted.
//! - The suite never decides trust policy; it only reports whether a
//!   signature matches a key.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod pickle_key;
mod suite;
mod vodozemac_suite;

pub use error::CryptoError;
pub use pickle_key::PickleKey;
pub use suite::{
    CipherSuite, GroupPlaintext, IdentityKeys, InboundCreation, InboundGroupSession, OlmAccount,
    OlmSession, OutboundGroupSession,
};

pub use vodozemac_suite::{
    VodozemacAccount, VodozemacGroupIn, VodozemacGroupOut, VodozemacSession, VodozemacSuite,
};
