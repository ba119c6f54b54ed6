//! Cipher suite backed by vodozemac.
//!
//! Sessions use the v1 configuration, the one every deployed client speaks.
//! Pickles are vodozemac's own encrypted pickle format keyed by the suite's
//! [`PickleKey`].

use std::collections::BTreeMap;

use keyward_proto::{Curve25519Key, Ed25519Key, OlmCiphertext, OlmMessageType, SessionId};
use vodozemac::{
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
    megolm::{
        self, GroupSessionPickle, InboundGroupSessionPickle, MegolmMessage, SessionKey,
        SessionOrdering,
    },
    olm::{self, AccountPickle, OlmMessage, SessionConfig, SessionPickle},
};

use crate::{
    CipherSuite, CryptoError, GroupPlaintext, IdentityKeys, InboundCreation, InboundGroupSession,
    OlmAccount, OlmSession, OutboundGroupSession, PickleKey,
};

fn curve_key(key: &Curve25519Key) -> Result<Curve25519PublicKey, CryptoError> {
    Curve25519PublicKey::from_base64(key.as_str())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Decode the unpadded base64 `body` of a wire ciphertext.
fn olm_message(message: &OlmCiphertext) -> Result<OlmMessage, CryptoError> {
    let decoded = match message.message_type {
        OlmMessageType::PreKey => {
            olm::PreKeyMessage::from_base64(&message.body).map(OlmMessage::PreKey)
        },
        OlmMessageType::Normal => olm::Message::from_base64(&message.body).map(OlmMessage::Normal),
    };
    decoded.map_err(|e| CryptoError::MalformedMessage(e.to_string()))
}

/// Olm account.
pub struct VodozemacAccount(olm::Account);

/// Olm session.
pub struct VodozemacSession(olm::Session);

/// Megolm outbound session.
pub struct VodozemacGroupOut(megolm::GroupSession);

/// Megolm inbound session.
pub struct VodozemacGroupIn(megolm::InboundGroupSession);

impl OlmAccount for VodozemacAccount {
    type Session = VodozemacSession;

    fn identity_keys(&self) -> IdentityKeys {
        let keys = self.0.identity_keys();
        IdentityKeys {
            ed25519: Ed25519Key::new(keys.ed25519.to_base64()),
            curve25519: Curve25519Key::new(keys.curve25519.to_base64()),
        }
    }

    fn sign(&self, message: &str) -> String {
        self.0.sign(message).to_base64()
    }

    fn max_one_time_keys(&self) -> usize {
        self.0.max_number_of_one_time_keys()
    }

    fn generate_one_time_keys(&mut self, count: usize) {
        self.0.generate_one_time_keys(count);
    }

    fn one_time_keys(&self) -> BTreeMap<String, Curve25519Key> {
        self.0
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| (id.to_base64(), Curve25519Key::new(key.to_base64())))
            .collect()
    }

    fn mark_keys_as_published(&mut self) {
        self.0.mark_keys_as_published();
    }

    fn create_outbound_session(
        &self,
        identity_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
    ) -> Result<VodozemacSession, CryptoError> {
        let identity_key = curve_key(identity_key)?;
        let one_time_key = curve_key(one_time_key)?;
        let session =
            self.0.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key);
        Ok(VodozemacSession(session))
    }

    fn create_inbound_session(
        &mut self,
        sender_key: &Curve25519Key,
        message: &OlmCiphertext,
    ) -> Result<InboundCreation<VodozemacSession>, CryptoError> {
        let sender_key = curve_key(sender_key)?;
        let OlmMessage::PreKey(pre_key) = olm_message(message)? else {
            return Err(CryptoError::SessionCreation("not a pre-key message".to_string()));
        };

        let result = self
            .0
            .create_inbound_session(sender_key, &pre_key)
            .map_err(|e| CryptoError::SessionCreation(e.to_string()))?;

        Ok(InboundCreation {
            session: VodozemacSession(result.session),
            plaintext: result.plaintext,
        })
    }
}

impl OlmSession for VodozemacSession {
    fn session_id(&self) -> SessionId {
        SessionId::new(self.0.session_id())
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> OlmCiphertext {
        match self.0.encrypt(plaintext) {
            OlmMessage::PreKey(message) => {
                OlmCiphertext { message_type: OlmMessageType::PreKey, body: message.to_base64() }
            },
            OlmMessage::Normal(message) => {
                OlmCiphertext { message_type: OlmMessageType::Normal, body: message.to_base64() }
            },
        }
    }

    fn decrypt(&mut self, message: &OlmCiphertext) -> Result<Vec<u8>, CryptoError> {
        let message = olm_message(message)?;
        self.0.decrypt(&message).map_err(|e| CryptoError::Decryption(e.to_string()))
    }
}

impl OutboundGroupSession for VodozemacGroupOut {
    fn session_id(&self) -> SessionId {
        SessionId::new(self.0.session_id())
    }

    fn session_key(&self) -> String {
        self.0.session_key().to_base64()
    }

    fn message_index(&self) -> u32 {
        self.0.message_index()
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> String {
        self.0.encrypt(plaintext).to_base64()
    }
}

impl InboundGroupSession for VodozemacGroupIn {
    fn session_id(&self) -> SessionId {
        SessionId::new(self.0.session_id())
    }

    fn first_known_index(&self) -> u32 {
        self.0.first_known_index()
    }

    fn same_key_as(&mut self, other: &mut Self) -> bool {
        self.0.compare(&mut other.0) == SessionOrdering::Equal
    }

    fn decrypt(&mut self, ciphertext: &str) -> Result<GroupPlaintext, CryptoError> {
        let message = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| CryptoError::MalformedMessage(e.to_string()))?;
        let decrypted =
            self.0.decrypt(&message).map_err(|e| CryptoError::Decryption(e.to_string()))?;
        Ok(GroupPlaintext {
            plaintext: decrypted.plaintext,
            message_index: decrypted.message_index,
        })
    }
}

/// [`CipherSuite`] backed by vodozemac.
#[derive(Debug, Clone)]
pub struct VodozemacSuite {
    pickle_key: PickleKey,
}

impl VodozemacSuite {
    /// Create a suite that encrypts pickles with `pickle_key`.
    pub fn new(pickle_key: PickleKey) -> Self {
        Self { pickle_key }
    }

    fn key(&self) -> &[u8; 32] {
        self.pickle_key.as_bytes()
    }
}

impl CipherSuite for VodozemacSuite {
    type Account = VodozemacAccount;
    type Session = VodozemacSession;
    type GroupOut = VodozemacGroupOut;
    type GroupIn = VodozemacGroupIn;

    fn create_account(&self) -> VodozemacAccount {
        VodozemacAccount(olm::Account::new())
    }

    fn create_outbound_group_session(&self) -> VodozemacGroupOut {
        VodozemacGroupOut(megolm::GroupSession::new(megolm::SessionConfig::version_1()))
    }

    fn create_inbound_group_session(
        &self,
        session_key: &str,
    ) -> Result<VodozemacGroupIn, CryptoError> {
        let key = SessionKey::from_base64(session_key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(VodozemacGroupIn(megolm::InboundGroupSession::new(
            &key,
            megolm::SessionConfig::version_1(),
        )))
    }

    fn verify_ed25519(
        &self,
        key: &Ed25519Key,
        message: &str,
        signature: &str,
    ) -> Result<(), CryptoError> {
        let key = Ed25519PublicKey::from_base64(key.as_str())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let signature = Ed25519Signature::from_base64(signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))?;
        key.verify(message.as_bytes(), &signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))
    }

    fn pickle_account(&self, account: &VodozemacAccount) -> String {
        account.0.pickle().encrypt(self.key())
    }

    fn unpickle_account(&self, pickle: &str) -> Result<VodozemacAccount, CryptoError> {
        let pickle = AccountPickle::from_encrypted(pickle, self.key())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(VodozemacAccount(olm::Account::from_pickle(pickle)))
    }

    fn pickle_session(&self, session: &VodozemacSession) -> String {
        session.0.pickle().encrypt(self.key())
    }

    fn unpickle_session(&self, pickle: &str) -> Result<VodozemacSession, CryptoError> {
        let pickle = SessionPickle::from_encrypted(pickle, self.key())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(VodozemacSession(olm::Session::from_pickle(pickle)))
    }

    fn pickle_group_out(&self, session: &VodozemacGroupOut) -> String {
        session.0.pickle().encrypt(self.key())
    }

    fn unpickle_group_out(&self, pickle: &str) -> Result<VodozemacGroupOut, CryptoError> {
        let pickle = GroupSessionPickle::from_encrypted(pickle, self.key())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(VodozemacGroupOut(megolm::GroupSession::from_pickle(pickle)))
    }

    fn pickle_group_in(&self, session: &VodozemacGroupIn) -> String {
        session.0.pickle().encrypt(self.key())
    }

    fn unpickle_group_in(&self, pickle: &str) -> Result<VodozemacGroupIn, CryptoError> {
        let pickle = InboundGroupSessionPickle::from_encrypted(pickle, self.key())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(VodozemacGroupIn(megolm::InboundGroupSession::from_pickle(pickle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suite() -> VodozemacSuite {
        VodozemacSuite::new(PickleKey::from_bytes([1u8; 32]))
    }

    fn first_one_time_key(account: &mut VodozemacAccount) -> Curve25519Key {
        account.generate_one_time_keys(1);
        let key = account.one_time_keys().into_values().next().unwrap();
        account.mark_keys_as_published();
        key
    }

    #[test]
    fn olm_pre_key_then_normal() {
        let suite = suite();
        let alice = suite.create_account();
        let mut bob = suite.create_account();
        let otk = first_one_time_key(&mut bob);

        let mut alice_session =
            alice.create_outbound_session(&bob.identity_keys().curve25519, &otk).unwrap();
        let first = alice_session.encrypt(b"hello");
        assert!(first.is_pre_key());

        let created =
            bob.create_inbound_session(&alice.identity_keys().curve25519, &first).unwrap();
        assert_eq!(created.plaintext, b"hello");
        let mut bob_session = created.session;
        assert_eq!(bob_session.session_id(), alice_session.session_id());

        let reply = bob_session.encrypt(b"hi");
        assert_eq!(alice_session.decrypt(&reply).unwrap(), b"hi");

        let second = alice_session.encrypt(b"again");
        assert_eq!(second.message_type, OlmMessageType::Normal);
        assert_eq!(bob_session.decrypt(&second).unwrap(), b"again");
    }

    #[test]
    fn inbound_session_rejects_normal_message() {
        let suite = suite();
        let mut bob = suite.create_account();
        let message = OlmCiphertext { message_type: OlmMessageType::Normal, body: "AAAA".into() };

        let result = bob.create_inbound_session(&bob.identity_keys().curve25519, &message);
        assert!(result.is_err());
    }

    #[test]
    fn olm_body_is_base64_text() {
        let suite = suite();
        let alice = suite.create_account();
        let mut bob = suite.create_account();
        let otk = first_one_time_key(&mut bob);
        let alice_key = alice.identity_keys().curve25519;

        let mut session =
            alice.create_outbound_session(&bob.identity_keys().curve25519, &otk).unwrap();
        let message = session.encrypt(b"hello");
        let alphabet = |b: u8| b.is_ascii_alphanumeric() || b == b'+' || b == b'/';
        assert!(message.body.bytes().all(alphabet));
        assert!(olm::PreKeyMessage::from_base64(&message.body).is_ok());

        let garbled = OlmCiphertext { message_type: OlmMessageType::PreKey, body: "¿no?".into() };
        let result = bob.create_inbound_session(&alice_key, &garbled);
        assert!(matches!(result, Err(CryptoError::MalformedMessage(_))));

        let created = bob.create_inbound_session(&alice_key, &message).unwrap();
        assert_eq!(created.plaintext, b"hello");
    }

    #[test]
    fn megolm_shared_key_decrypts_with_index() {
        let suite = suite();
        let mut outbound = suite.create_outbound_group_session();
        let mut inbound = suite.create_inbound_group_session(&outbound.session_key()).unwrap();
        assert_eq!(inbound.session_id(), outbound.session_id());

        let first = outbound.encrypt(b"one");
        let second = outbound.encrypt(b"two");
        assert_eq!(outbound.message_index(), 2);

        let decrypted = inbound.decrypt(&second).unwrap();
        assert_eq!(decrypted.plaintext, b"two");
        assert_eq!(decrypted.message_index, 1);
        assert_eq!(inbound.decrypt(&first).unwrap().message_index, 0);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        #[test]
        fn prop_megolm_index_is_send_position(
            order in proptest::strategy::Strategy::prop_shuffle(
                proptest::strategy::Just((0u32..12).collect::<Vec<_>>())
            )
        ) {
            let suite = suite();
            let mut outbound = suite.create_outbound_group_session();
            let mut inbound =
                suite.create_inbound_group_session(&outbound.session_key()).unwrap();
            let sent: Vec<_> =
                (0u32..12).map(|i| outbound.encrypt(i.to_string().as_bytes())).collect();

            for position in order {
                let decrypted = inbound.decrypt(&sent[position as usize]).unwrap();
                proptest::prop_assert_eq!(decrypted.message_index, position);
                proptest::prop_assert_eq!(decrypted.plaintext, position.to_string().into_bytes());
            }
        }
    }

    #[test]
    fn megolm_same_key_comparison() {
        let suite = suite();
        let outbound = suite.create_outbound_group_session();
        let other = suite.create_outbound_group_session();

        let mut a = suite.create_inbound_group_session(&outbound.session_key()).unwrap();
        let mut b = suite.create_inbound_group_session(&outbound.session_key()).unwrap();
        let mut c = suite.create_inbound_group_session(&other.session_key()).unwrap();

        assert!(a.same_key_as(&mut b));
        assert!(!a.same_key_as(&mut c));
    }

    #[test]
    fn pickles_round_trip_under_same_key() {
        let suite = suite();
        let account = suite.create_account();
        let restored = suite.unpickle_account(&suite.pickle_account(&account)).unwrap();
        assert_eq!(restored.identity_keys(), account.identity_keys());

        let mut outbound = suite.create_outbound_group_session();
        outbound.encrypt(b"advance");
        let restored = suite.unpickle_group_out(&suite.pickle_group_out(&outbound)).unwrap();
        assert_eq!(restored.message_index(), 1);
        assert_eq!(restored.session_key(), outbound.session_key());
    }

    #[test]
    fn pickle_under_other_key_fails() {
        let account = suite().create_account();
        let pickle = suite().pickle_account(&account);

        let other = VodozemacSuite::new(PickleKey::from_bytes([2u8; 32]));
        assert!(matches!(other.unpickle_account(&pickle), Err(CryptoError::Pickle(_))));
    }

    #[test]
    fn signatures_verify_against_identity_key() {
        let suite = suite();
        let account = suite.create_account();
        let signature = account.sign("payload");
        let key = account.identity_keys().ed25519;

        assert!(suite.verify_ed25519(&key, "payload", &signature).is_ok());
        assert!(matches!(
            suite.verify_ed25519(&key, "tampered", &signature),
            Err(CryptoError::Signature(_))
        ));
    }
}
