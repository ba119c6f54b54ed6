//! Our own device identity and key publication.
//!
//! The account is created once per (user, device) and persisted under
//! `crypto_me`. Its public keys are published as a self-signed device key
//! bundle together with a batch of signed one-time keys. Remote devices claim
//! one one-time key each to open a pairwise session with us, so the server
//! side pool is topped up whenever a sync reports it running low.

use std::collections::BTreeMap;

use keyward_crypto::{CipherSuite, IdentityKeys, OlmAccount};
use keyward_proto::{
    Algorithm, DeviceId, DeviceKeys, Ed25519Key, KeysUploadRequest, OneTimeKey, ProtocolError,
    SIGNED_CURVE25519, SigningKeys, UserId,
};

use crate::{
    env::Environment,
    error::MachineError,
    machine::CryptoMachine,
    store::{AccountRecord, Storage},
    transport::Transport,
};

/// Our device: ids, identity keys and the account handle.
pub struct OwnIdentity<A: OlmAccount> {
    user_id: UserId,
    device_id: DeviceId,
    keys: IdentityKeys,
    pub(crate) account: A,
    keys_published: bool,
}

impl<A: OlmAccount> OwnIdentity<A> {
    pub(crate) fn new(user_id: UserId, device_id: DeviceId, account: A, published: bool) -> Self {
        let keys = account.identity_keys();
        Self { user_id, device_id, keys, account, keys_published: published }
    }

    /// Our user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Public identity keys.
    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    /// Whether the signed device keys reached the server.
    pub fn keys_published(&self) -> bool {
        self.keys_published
    }

    /// Unpublished one-time keys currently held by the account.
    pub fn unpublished_one_time_keys(&self) -> usize {
        self.account.one_time_keys().len()
    }

    pub(crate) fn signing_keys(&self) -> SigningKeys {
        SigningKeys { ed25519: self.keys.ed25519.clone() }
    }

    pub(crate) fn record<C: CipherSuite<Account = A>>(&self, suite: &C) -> AccountRecord {
        AccountRecord {
            ed25519: self.keys.ed25519.clone(),
            curve25519: self.keys.curve25519.clone(),
            pickle: suite.pickle_account(&self.account),
        }
    }

    /// Self-signed device key bundle advertising olm and megolm.
    pub(crate) fn device_keys(&self) -> Result<DeviceKeys, ProtocolError> {
        let keys = BTreeMap::from([
            (format!("curve25519:{}", self.device_id), self.keys.curve25519.to_string()),
            (format!("ed25519:{}", self.device_id), self.keys.ed25519.to_string()),
        ]);
        let mut bundle = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![Algorithm::OLM_V1.to_string(), Algorithm::MEGOLM_V1.to_string()],
            keys,
            signatures: BTreeMap::new(),
        };
        let signature = self.account.sign(&bundle.signable()?);
        bundle.signatures.insert(
            self.user_id.clone(),
            BTreeMap::from([(self.signature_key_id(), signature)]),
        );
        Ok(bundle)
    }

    /// Every unpublished one-time key, signed, keyed by
    /// `signed_curve25519:<key_id>`.
    pub(crate) fn signed_one_time_keys(
        &self,
    ) -> Result<BTreeMap<String, OneTimeKey>, ProtocolError> {
        let mut signed = BTreeMap::new();
        for (key_id, key) in self.account.one_time_keys() {
            let mut one_time_key = OneTimeKey { key, signatures: BTreeMap::new() };
            let signature = self.account.sign(&one_time_key.signable()?);
            one_time_key.signatures.insert(
                self.user_id.clone(),
                BTreeMap::from([(self.signature_key_id(), signature)]),
            );
            signed.insert(format!("{SIGNED_CURVE25519}:{key_id}"), one_time_key);
        }
        Ok(signed)
    }

    /// Top the account up to `target` unpublished one-time keys.
    ///
    /// Keys left over from a failed upload count towards the target, so
    /// repeated failures do not grow the pool.
    pub(crate) fn prepare_one_time_keys(&mut self, target: usize) {
        let target = target.min(self.account.max_one_time_keys());
        let missing = target.saturating_sub(self.account.one_time_keys().len());
        if missing > 0 {
            self.account.generate_one_time_keys(missing);
        }
    }

    pub(crate) fn mark_published(&mut self) {
        self.account.mark_keys_as_published();
        self.keys_published = true;
    }

    fn signature_key_id(&self) -> String {
        format!("ed25519:{}", self.device_id)
    }

    pub(crate) fn ed25519(&self) -> &Ed25519Key {
        &self.keys.ed25519
    }
}

impl<C: CipherSuite, T: Transport, S: Storage, E: Environment> CryptoMachine<C, T, S, E> {
    /// Upload signed device keys and a first batch of one-time keys.
    ///
    /// No-op once the keys are published. On failure nothing is marked
    /// published and the next call retries with the same one-time keys.
    pub async fn publish_keys(&mut self) -> Result<(), MachineError> {
        if self.identity.keys_published() {
            return Ok(());
        }

        self.identity.prepare_one_time_keys(self.config.one_time_keys_per_upload);
        let request = KeysUploadRequest {
            device_keys: Some(self.identity.device_keys()?),
            one_time_keys: self.identity.signed_one_time_keys()?,
        };
        let count = request.one_time_keys.len();
        self.transport.upload_keys(&request).await?;

        self.identity.mark_published();
        self.persist_account()?;
        self.store.mark_keys_published(self.identity.user_id(), self.identity.device_id())?;

        tracing::info!(
            user_id = %self.identity.user_id(),
            device_id = %self.identity.device_id(),
            one_time_keys = count,
            "Published device keys"
        );
        Ok(())
    }

    /// Upload a fresh batch of one-time keys if the server holds fewer than
    /// the configured threshold.
    ///
    /// Returns the number of keys uploaded.
    pub async fn top_up_one_time_keys(&mut self, server_count: u64) -> Result<usize, MachineError> {
        if !self.identity.keys_published() || server_count >= self.config.one_time_key_threshold {
            return Ok(0);
        }

        self.identity.prepare_one_time_keys(self.config.one_time_keys_per_upload);
        let request = KeysUploadRequest {
            device_keys: None,
            one_time_keys: self.identity.signed_one_time_keys()?,
        };
        let count = request.one_time_keys.len();
        if count == 0 {
            return Ok(0);
        }
        self.transport.upload_keys(&request).await?;

        self.identity.mark_published();
        self.persist_account()?;

        tracing::debug!(server_count, uploaded = count, "Topped up one-time keys");
        Ok(count)
    }

    /// Write the account back after any change to its one-time keys.
    pub(crate) fn persist_account(&self) -> Result<(), MachineError> {
        let record = self.identity.record(&self.suite);
        self.store.store_account(self.identity.user_id(), self.identity.device_id(), &record)?;
        Ok(())
    }
}
