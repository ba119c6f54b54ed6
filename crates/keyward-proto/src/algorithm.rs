//! Encryption algorithm identifiers.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ProtocolError;

/// Algorithm tag for signed Curve25519 one-time keys.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// Room encryption algorithm.
///
/// `None` is the initial state of every room. A room only ever moves from
/// `None` to one concrete algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Plaintext room
    #[default]
    None,
    /// Pairwise olm, one ciphertext per recipient device
    Olm,
    /// Group megolm, one ciphertext per message
    Megolm,
}

impl Algorithm {
    /// Wire name of the olm algorithm.
    pub const OLM_V1: &'static str = "m.olm.v1.curve25519-aes-sha2";
    /// Wire name of the megolm algorithm.
    pub const MEGOLM_V1: &'static str = "m.megolm.v1.aes-sha2";

    /// Wire name, empty for `None`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Olm => Self::OLM_V1,
            Self::Megolm => Self::MEGOLM_V1,
        }
    }

    /// True for the two concrete algorithms.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

impl FromStr for Algorithm {
    type Err = ProtocolError;

    /// Parses a concrete algorithm. The empty string maps to `None`, which is
    /// how an unset algorithm is persisted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::None),
            Self::OLM_V1 => Ok(Self::Olm),
            Self::MEGOLM_V1 => Ok(Self::Megolm),
            other => Err(ProtocolError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl Serialize for Algorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_parse_back() {
        for alg in [Algorithm::None, Algorithm::Olm, Algorithm::Megolm] {
            assert_eq!(alg.as_str().parse::<Algorithm>().unwrap(), alg);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        let err = "m.olm.curve25519-aes-sha256".parse::<Algorithm>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedAlgorithm(_)));
    }

    proptest::proptest! {
        #[test]
        fn prop_only_wire_names_parse(tag in "(m\\.(olm|megolm)\\.v1\\.[a-z0-9-]{0,24})|.{0,12}") {
            let known = ["", Algorithm::OLM_V1, Algorithm::MEGOLM_V1].contains(&tag.as_str());
            match tag.parse::<Algorithm>() {
                Ok(alg) => {
                    proptest::prop_assert!(known);
                    proptest::prop_assert_eq!(alg.as_str(), tag.as_str());
                },
                Err(_) => proptest::prop_assert!(!known),
            }
        }
    }

    #[test]
    fn none_is_not_encrypted() {
        assert!(!Algorithm::None.is_encrypted());
        assert!(Algorithm::Olm.is_encrypted());
        assert!(Algorithm::Megolm.is_encrypted());
    }
}
