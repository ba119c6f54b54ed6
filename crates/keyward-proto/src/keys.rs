//! Device key bundles and one-time key requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ProtocolError, Result, SIGNED_CURVE25519,
    ids::{Curve25519Key, DeviceId, Ed25519Key, UserId},
};

/// Signatures keyed by signing user, then by `ed25519:<device_id>`.
pub type Signatures = BTreeMap<UserId, BTreeMap<String, String>>;

/// Encode `value` as canonical JSON for signing.
///
/// Object keys are sorted, whitespace is stripped, and the top-level
/// `signatures` and `unsigned` members are removed. The workspace relies on
/// `serde_json`'s default sorted map; enabling its `preserve_order` feature
/// would break signature agreement with other clients.
pub fn canonical_json(value: &impl Serialize) -> Result<String> {
    let mut value = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut value {
        map.remove("signatures");
        map.remove("unsigned");
    }
    Ok(serde_json::to_string(&value)?)
}

/// Published identity keys of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// Owning user
    pub user_id: UserId,

    /// Device the keys belong to
    pub device_id: DeviceId,

    /// Encryption algorithms the device supports
    pub algorithms: Vec<String>,

    /// Keys by `<algorithm>:<device_id>`
    pub keys: BTreeMap<String, String>,

    /// Signatures over the canonical form of this bundle
    #[serde(default)]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// The device's Curve25519 agreement key, if published.
    pub fn curve25519(&self) -> Option<Curve25519Key> {
        self.keys
            .get(&format!("curve25519:{}", self.device_id))
            .map(|k| Curve25519Key::from(k.as_str()))
    }

    /// The device's Ed25519 signing key, if published.
    pub fn ed25519(&self) -> Option<Ed25519Key> {
        self.keys.get(&format!("ed25519:{}", self.device_id)).map(|k| Ed25519Key::from(k.as_str()))
    }

    /// The device's self-signature, if present.
    pub fn self_signature(&self) -> Option<&str> {
        self.signatures
            .get(&self.user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{}", self.device_id)))
            .map(String::as_str)
    }

    /// Canonical JSON that signatures are computed over.
    pub fn signable(&self) -> Result<String> {
        canonical_json(self)
    }
}

/// A signed one-time key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeKey {
    /// Curve25519 public key
    pub key: Curve25519Key,

    /// Signatures by the owning device
    #[serde(default)]
    pub signatures: Signatures,
}

impl OneTimeKey {
    /// Canonical JSON that signatures are computed over.
    pub fn signable(&self) -> Result<String> {
        canonical_json(self)
    }

    /// Signature by `user_id`'s device `device_id`, if present.
    pub fn signature_by(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&str> {
        self.signatures
            .get(user_id)
            .and_then(|sigs| sigs.get(&format!("ed25519:{device_id}")))
            .map(String::as_str)
    }
}

/// `/keys/query` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// Device bundles per user per device
    #[serde(default)]
    pub device_keys: BTreeMap<UserId, BTreeMap<DeviceId, DeviceKeys>>,
}

/// `/keys/claim` request body: algorithm to claim per user per device.
pub type KeysClaimRequest = BTreeMap<UserId, BTreeMap<DeviceId, String>>;

/// `/keys/claim` response.
///
/// Values are kept raw: a server may return keys of other algorithms (plain
/// strings for unsigned `curve25519`), and only `signed_curve25519` entries
/// are usable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// Claimed keys per user per device, keyed by `<algorithm>:<key_id>`
    #[serde(default)]
    pub one_time_keys: BTreeMap<UserId, BTreeMap<DeviceId, BTreeMap<String, Value>>>,
}

impl KeysClaimResponse {
    /// Whether the server returned anything for this device.
    pub fn has_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.one_time_keys.get(user_id).is_some_and(|devices| devices.contains_key(device_id))
    }

    /// The first `signed_curve25519` key returned for a device.
    ///
    /// Returns `Ok(None)` when the device has entries but none with the
    /// expected algorithm tag.
    pub fn signed_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<(String, OneTimeKey)>> {
        let Some(entries) = self.one_time_keys.get(user_id).and_then(|d| d.get(device_id)) else {
            return Ok(None);
        };

        for (key_id, value) in entries {
            let Some((algorithm, _)) = key_id.split_once(':') else {
                continue;
            };
            if algorithm != SIGNED_CURVE25519 {
                continue;
            }
            let key: OneTimeKey = serde_json::from_value(value.clone()).map_err(|e| {
                ProtocolError::InvalidContent {
                    event_type: "keys/claim".to_string(),
                    reason: e.to_string(),
                }
            })?;
            return Ok(Some((key_id.clone(), key)));
        }

        Ok(None)
    }
}

/// `/keys/upload` request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// Signed device keys, sent on first upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,

    /// Signed one-time keys keyed by `signed_curve25519:<key_id>`
    #[serde(default)]
    pub one_time_keys: BTreeMap<String, OneTimeKey>,
}

/// `/keys/upload` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// Unclaimed one-time keys remaining on the server, by algorithm
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn bundle() -> DeviceKeys {
        let mut keys = BTreeMap::new();
        keys.insert("curve25519:DEV".to_string(), "ck".to_string());
        keys.insert("ed25519:DEV".to_string(), "ek".to_string());

        let mut sigs = BTreeMap::new();
        sigs.insert("ed25519:DEV".to_string(), "sig".to_string());

        DeviceKeys {
            user_id: UserId::from("@bob:x"),
            device_id: DeviceId::from("DEV"),
            algorithms: vec!["m.olm.v1.curve25519-aes-sha2".to_string()],
            keys,
            signatures: BTreeMap::from([(UserId::from("@bob:x"), sigs)]),
        }
    }

    #[test]
    fn device_keys_expose_typed_keys() {
        let keys = bundle();
        assert_eq!(keys.curve25519(), Some(Curve25519Key::from("ck")));
        assert_eq!(keys.ed25519(), Some(Ed25519Key::from("ek")));
        assert_eq!(keys.self_signature(), Some("sig"));
    }

    #[test]
    fn canonical_json_drops_signatures_and_sorts_keys() {
        let canonical = bundle().signable().unwrap();
        assert!(!canonical.contains("signatures"));
        assert!(canonical.starts_with("{\"algorithms\""));
        assert!(!canonical.contains(' '));
    }

    #[test]
    fn claim_response_skips_other_algorithms() {
        let response: KeysClaimResponse = serde_json::from_value(json!({
            "one_time_keys": {
                "@bob:x": {
                    "DEV": {
                        "curve25519:AAAA": "unsigned",
                        "signed_curve25519:AAAB": { "key": "otk", "signatures": {} }
                    }
                }
            }
        }))
        .unwrap();

        let user = UserId::from("@bob:x");
        let device = DeviceId::from("DEV");
        let (key_id, key) = response.signed_key(&user, &device).unwrap().unwrap();
        assert_eq!(key_id, "signed_curve25519:AAAB");
        assert_eq!(key.key, Curve25519Key::from("otk"));
    }

    #[test]
    fn claim_response_without_signed_key_yields_none() {
        let response: KeysClaimResponse = serde_json::from_value(json!({
            "one_time_keys": { "@bob:x": { "DEV": { "curve25519:AAAA": "unsigned" } } }
        }))
        .unwrap();

        let user = UserId::from("@bob:x");
        let device = DeviceId::from("DEV");
        assert!(response.has_device(&user, &device));
        assert!(response.signed_key(&user, &device).unwrap().is_none());
        assert!(!response.has_device(&user, &DeviceId::from("OTHER")));
    }
}
