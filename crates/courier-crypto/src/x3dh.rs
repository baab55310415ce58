//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! Asynchronous session establishment against a published prekey bundle.
//!
//! # Protocol Overview
//!
//! 1. Bob publishes his identity key (IK), a signed prekey (SPK) and a pool
//!    of one-time prekeys (OPK)
//! 2. Alice fetches one bundle, verifies the SPK signature, generates an
//!    ephemeral key (EK) and computes:
//!    - DH1 = DH(IK_A, SPK_B)
//!    - DH2 = DH(EK_A, IK_B)
//!    - DH3 = DH(EK_A, SPK_B)
//!    - DH4 = DH(EK_A, OPK_B) (if OPK present)
//! 3. Shared secret = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])
//! 4. Alice attaches an [`X3DHHeader`] to every message until Bob replies;
//!    Bob recomputes the secret from it with [`X3DHKeyAgreement::respond`].

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::identity::{IdentityKeyPair, IdentityPublicKey};
use crate::kdf::{domain, KeyDerivationContext};
use crate::keys::{
    EphemeralKeyPair, OneTimePreKey, PreKeyBundle, PublicKeyBytes, SharedSecret, SignedPreKey,
};

/// Output of a completed X3DH agreement
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct X3DHSharedSecret {
    secret: [u8; 32],
    ad: Vec<u8>,
}

impl X3DHSharedSecret {
    /// Get the shared secret bytes
    pub fn secret(&self) -> &[u8; 32] {
        &self.secret
    }

    /// `IK_initiator || IK_responder`, bound into every ratchet message
    pub fn associated_data(&self) -> &[u8] {
        &self.ad
    }
}

/// Handshake parameters the initiator attaches to its first messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3DHHeader {
    /// Initiator's Ed25519 identity key
    #[serde(with = "hex::serde")]
    pub identity_key: [u8; 32],
    /// Ephemeral public key used in X3DH
    pub ephemeral_key: PublicKeyBytes,
    /// ID of the responder's signed prekey that was used
    pub signed_prekey_id: u32,
    /// ID of the one-time prekey used (if any)
    pub one_time_prekey_id: Option<u32>,
}

#[derive(Clone)]
struct SignedPreKeyPair {
    id: u32,
    secret: X25519StaticSecret,
    signature: [u8; 64],
    timestamp: i64,
}

impl SignedPreKeyPair {
    fn public(&self) -> SignedPreKey {
        SignedPreKey {
            id: self.id,
            public_key: PublicKeyBytes::from_secret(&self.secret),
            signature: self.signature,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Clone)]
struct OneTimePreKeyPair {
    id: u32,
    secret: X25519StaticSecret,
    issued: bool,
}

/// Owner-side prekey material
///
/// Each issued bundle names a different one-time prekey; the key stays until
/// a handshake consumes it. The previous signed prekey is kept after rotation
/// so handshakes already in flight still complete.
pub struct PreKeyManager {
    identity: IdentityKeyPair,
    signed_prekey: SignedPreKeyPair,
    previous_signed_prekey: Option<SignedPreKeyPair>,
    one_time_prekeys: Vec<OneTimePreKeyPair>,
    opk_counter: u32,
}

impl PreKeyManager {
    /// Create a manager with `one_time_prekeys` fresh one-time prekeys
    pub fn new(identity: IdentityKeyPair, one_time_prekeys: usize) -> Self {
        let signed_prekey = Self::generate_signed_prekey(&identity, 1);
        let mut manager = Self {
            identity,
            signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: Vec::new(),
            opk_counter: 0,
        };
        manager.generate_one_time_prekeys(one_time_prekeys);
        manager
    }

    fn generate_signed_prekey(identity: &IdentityKeyPair, id: u32) -> SignedPreKeyPair {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let signature = identity.sign(PublicKeyBytes::from_secret(&secret).as_bytes());

        SignedPreKeyPair {
            id,
            secret,
            signature,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Append `count` one-time prekeys to the pool
    pub fn generate_one_time_prekeys(&mut self, count: usize) {
        for _ in 0..count {
            self.opk_counter += 1;
            self.one_time_prekeys.push(OneTimePreKeyPair {
                id: self.opk_counter,
                secret: X25519StaticSecret::random_from_rng(OsRng),
                issued: false,
            });
        }
    }

    /// Top the unissued pool back up to `target`; returns how many were added
    pub fn replenish(&mut self, target: usize) -> usize {
        let available = self.available_one_time_prekeys();
        let missing = target.saturating_sub(available);
        self.generate_one_time_prekeys(missing);
        missing
    }

    /// One-time prekeys not yet handed out in a bundle
    pub fn available_one_time_prekeys(&self) -> usize {
        self.one_time_prekeys.iter().filter(|k| !k.issued).count()
    }

    /// Hand out a bundle with the next unissued one-time prekey
    pub fn issue_bundle(&mut self) -> PreKeyBundle {
        let opk = self
            .one_time_prekeys
            .iter_mut()
            .find(|k| !k.issued)
            .map(|k| {
                k.issued = true;
                OneTimePreKey {
                    id: k.id,
                    public_key: PublicKeyBytes::from_secret(&k.secret),
                }
            });

        PreKeyBundle {
            identity_key: self.identity.public_key_bytes(),
            signed_prekey: self.signed_prekey.public(),
            one_time_prekey: opk,
        }
    }

    /// Secret of the current or previous signed prekey with this id
    pub fn signed_prekey_secret(&self, id: u32) -> Option<X25519StaticSecret> {
        std::iter::once(&self.signed_prekey)
            .chain(self.previous_signed_prekey.iter())
            .find(|k| k.id == id)
            .map(|k| k.secret.clone())
    }

    /// Secret of a one-time prekey still in the pool
    pub fn one_time_prekey_secret(&self, id: u32) -> Option<X25519StaticSecret> {
        self.one_time_prekeys
            .iter()
            .find(|k| k.id == id)
            .map(|k| k.secret.clone())
    }

    /// Drop a one-time prekey after a handshake used it
    pub fn consume_one_time_prekey(&mut self, id: u32) -> bool {
        let before = self.one_time_prekeys.len();
        self.one_time_prekeys.retain(|k| k.id != id);
        self.one_time_prekeys.len() != before
    }

    /// Replace the signed prekey, keeping the old one for in-flight handshakes
    pub fn rotate_signed_prekey(&mut self) {
        let next = Self::generate_signed_prekey(&self.identity, self.signed_prekey.id + 1);
        self.previous_signed_prekey = Some(std::mem::replace(&mut self.signed_prekey, next));
    }

    /// Get identity key pair reference
    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }
}

/// X3DH key agreement
pub struct X3DHKeyAgreement;

impl X3DHKeyAgreement {
    /// Initiator side: verify the bundle and derive the shared secret
    ///
    /// Fails with [`CryptoError::InvalidPublicKey`] for a malformed identity
    /// key and [`CryptoError::InvalidSignature`] for a forged signed prekey.
    pub fn initiate(
        our_identity: &IdentityKeyPair,
        their_bundle: &PreKeyBundle,
    ) -> Result<(X3DHSharedSecret, X3DHHeader)> {
        let their_identity = IdentityPublicKey::from_bytes(&their_bundle.identity_key)?;
        their_bundle.signed_prekey.verify(&their_identity.signing_key)?;

        let ephemeral = EphemeralKeyPair::generate();
        let spk_public = their_bundle.signed_prekey.public_key.to_x25519();

        let dh1 = our_identity.diffie_hellman(&spk_public);
        let dh2 = ephemeral.diffie_hellman(&their_identity.dh_key);
        let dh3 = ephemeral.diffie_hellman(&spk_public);
        let dh4 = their_bundle
            .one_time_prekey
            .as_ref()
            .map(|opk| ephemeral.diffie_hellman(&opk.public_key.to_x25519()));

        let shared_secret = Self::derive_shared_secret(
            [&dh1, &dh2, &dh3],
            dh4.as_ref(),
            &our_identity.public_key(),
            &their_identity,
        )?;

        let header = X3DHHeader {
            identity_key: our_identity.public_key_bytes(),
            ephemeral_key: ephemeral.public_key_bytes(),
            signed_prekey_id: their_bundle.signed_prekey.id,
            one_time_prekey_id: their_bundle.one_time_prekey.as_ref().map(|opk| opk.id),
        };

        Ok((shared_secret, header))
    }

    /// Responder side: recompute the initiator's secret from its header
    ///
    /// The caller resolves `header.signed_prekey_id` and
    /// `header.one_time_prekey_id` to secrets; a header naming a one-time
    /// prekey that was not supplied fails with [`CryptoError::PrekeyNotFound`].
    pub fn respond(
        our_identity: &IdentityKeyPair,
        our_signed_prekey: &X25519StaticSecret,
        our_one_time_prekey: Option<&X25519StaticSecret>,
        header: &X3DHHeader,
    ) -> Result<X3DHSharedSecret> {
        let their_identity = IdentityPublicKey::from_bytes(&header.identity_key)?;
        let ephemeral_public = header.ephemeral_key.to_x25519();

        let dh = |secret: &X25519StaticSecret, public: &X25519PublicKey| {
            SharedSecret(*secret.diffie_hellman(public).as_bytes())
        };

        let dh1 = dh(our_signed_prekey, &their_identity.dh_key);
        let dh2 = our_identity.diffie_hellman(&ephemeral_public);
        let dh3 = dh(our_signed_prekey, &ephemeral_public);
        let dh4 = match (header.one_time_prekey_id, our_one_time_prekey) {
            (Some(_), Some(opk)) => Some(dh(opk, &ephemeral_public)),
            (Some(id), None) => return Err(CryptoError::PrekeyNotFound(format!("one-time prekey {}", id))),
            (None, _) => None,
        };

        Self::derive_shared_secret(
            [&dh1, &dh2, &dh3],
            dh4.as_ref(),
            &their_identity,
            &our_identity.public_key(),
        )
    }

    fn derive_shared_secret(
        dhs: [&SharedSecret; 3],
        dh4: Option<&SharedSecret>,
        initiator_identity: &IdentityPublicKey,
        responder_identity: &IdentityPublicKey,
    ) -> Result<X3DHSharedSecret> {
        let mut ikm = Vec::with_capacity(160);
        ikm.extend_from_slice(&[0xFF; 32]);
        for dh in dhs.into_iter().chain(dh4) {
            ikm.extend_from_slice(dh.as_bytes());
        }

        let secret = KeyDerivationContext::new(None, &ikm).derive::<32>(domain::ROOT_KEY)?;
        ikm.zeroize();

        let mut ad = Vec::with_capacity(128);
        ad.extend_from_slice(&initiator_identity.to_bytes());
        ad.extend_from_slice(&responder_identity.to_bytes());

        Ok(X3DHSharedSecret {
            secret: secret.to_bytes(),
            ad,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond_with(bob: &PreKeyManager, header: &X3DHHeader) -> Result<X3DHSharedSecret> {
        let spk = bob
            .signed_prekey_secret(header.signed_prekey_id)
            .expect("signed prekey");
        let opk = header
            .one_time_prekey_id
            .and_then(|id| bob.one_time_prekey_secret(id));
        X3DHKeyAgreement::respond(bob.identity(), &spk, opk.as_ref(), header)
    }

    #[test]
    fn test_x3dh_key_agreement() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 5);

        let bundle = bob.issue_bundle();
        let (alice_secret, header) = X3DHKeyAgreement::initiate(&alice, &bundle).unwrap();
        assert_eq!(header.one_time_prekey_id, Some(1));

        let bob_secret = respond_with(&bob, &header).unwrap();
        assert_eq!(alice_secret.secret(), bob_secret.secret());
        assert_eq!(alice_secret.associated_data(), bob_secret.associated_data());
    }

    #[test]
    fn test_x3dh_without_one_time_prekey() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 0);

        let bundle = bob.issue_bundle();
        assert!(bundle.one_time_prekey.is_none());

        let (alice_secret, header) = X3DHKeyAgreement::initiate(&alice, &bundle).unwrap();
        let bob_secret = respond_with(&bob, &header).unwrap();
        assert_eq!(alice_secret.secret(), bob_secret.secret());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 1);

        let mut bundle = bob.issue_bundle();
        bundle.signed_prekey.signature[0] ^= 0xFF;

        assert!(matches!(
            X3DHKeyAgreement::initiate(&alice, &bundle),
            Err(CryptoError::InvalidSignature)
        ));
    }

    #[test]
    fn test_substituted_identity_rejected() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 1);

        // Signed prekey no longer matches the identity that signed it
        let mut bundle = bob.issue_bundle();
        bundle.identity_key = IdentityKeyPair::generate().public_key_bytes();

        assert!(X3DHKeyAgreement::initiate(&alice, &bundle).is_err());
    }

    #[test]
    fn test_each_bundle_gets_a_fresh_one_time_prekey() {
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 2);

        let first = bob.issue_bundle().one_time_prekey.map(|k| k.id);
        let second = bob.issue_bundle().one_time_prekey.map(|k| k.id);
        let third = bob.issue_bundle().one_time_prekey.map(|k| k.id);

        assert_eq!(first, Some(1));
        assert_eq!(second, Some(2));
        assert_eq!(third, None);
        assert_eq!(bob.available_one_time_prekeys(), 0);

        assert_eq!(bob.replenish(3), 3);
        assert_eq!(bob.issue_bundle().one_time_prekey.map(|k| k.id), Some(3));
    }

    #[test]
    fn test_consumed_one_time_prekey_is_gone() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 1);

        let bundle = bob.issue_bundle();
        let (_, header) = X3DHKeyAgreement::initiate(&alice, &bundle).unwrap();
        assert!(respond_with(&bob, &header).is_ok());

        assert!(bob.consume_one_time_prekey(1));
        assert!(!bob.consume_one_time_prekey(1));
        assert!(matches!(
            respond_with(&bob, &header),
            Err(CryptoError::PrekeyNotFound(_))
        ));
    }

    #[test]
    fn test_rotation_keeps_previous_signed_prekey() {
        let alice = IdentityKeyPair::generate();
        let mut bob = PreKeyManager::new(IdentityKeyPair::generate(), 1);

        let bundle = bob.issue_bundle();
        let (alice_secret, header) = X3DHKeyAgreement::initiate(&alice, &bundle).unwrap();

        bob.rotate_signed_prekey();
        assert_eq!(bob.issue_bundle().signed_prekey.id, 2);

        let bob_secret = respond_with(&bob, &header).unwrap();
        assert_eq!(alice_secret.secret(), bob_secret.secret());
    }
}
