//! Long-term identity keys
//!
//! A device owner has a single Ed25519 identity key, generated once. The
//! X25519 half used by X3DH is derived from it, so peers only ever need the
//! 32-byte Ed25519 public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::error::{CryptoError, Result};
use crate::keys::SharedSecret;

/// Identity key pair (Ed25519 for signing, X25519 derived for DH)
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    signing_key: SigningKey,
    #[zeroize(skip)]
    dh_secret: X25519StaticSecret,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Restore from the 32-byte Ed25519 seed
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let dh_secret = Self::derive_x25519_secret(&signing_key);
        Self {
            signing_key,
            dh_secret,
        }
    }

    /// Same scalar Ed25519 signs with: clamped low half of SHA-512(seed)
    fn derive_x25519_secret(signing_key: &SigningKey) -> X25519StaticSecret {
        let hash = Sha512::digest(signing_key.to_bytes());

        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hash[..32]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;

        X25519StaticSecret::from(scalar)
    }

    /// Get the public identity key
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            signing_key: self.signing_key.verifying_key(),
            dh_key: X25519PublicKey::from(&self.dh_secret),
        }
    }

    /// Ed25519 public key bytes, the form peers exchange
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Perform Diffie-Hellman with the derived X25519 secret
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let shared = self.dh_secret.diffie_hellman(their_public);
        SharedSecret(*shared.as_bytes())
    }

    /// The Ed25519 seed, for keystore persistence
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl Clone for IdentityKeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(&self.signing_key.to_bytes())
    }
}

/// Public identity key
#[derive(Clone, Debug)]
pub struct IdentityPublicKey {
    /// Ed25519 verifying key
    pub signing_key: VerifyingKey,
    /// X25519 public key for DH
    pub dh_key: X25519PublicKey,
}

impl IdentityPublicKey {
    /// Parse an Ed25519 public key and derive its X25519 counterpart
    pub fn from_bytes(ed25519_bytes: &[u8; 32]) -> Result<Self> {
        let signing_key = VerifyingKey::from_bytes(ed25519_bytes)
            .map_err(|_| CryptoError::InvalidPublicKey("not an Ed25519 point".to_string()))?;
        if signing_key.is_weak() {
            return Err(CryptoError::InvalidPublicKey("small-order Ed25519 key".to_string()));
        }
        let dh_key = Self::montgomery_form(&signing_key)?;

        Ok(Self { signing_key, dh_key })
    }

    fn montgomery_form(ed_pk: &VerifyingKey) -> Result<X25519PublicKey> {
        use curve25519_dalek::edwards::CompressedEdwardsY;

        let edwards = CompressedEdwardsY(ed_pk.to_bytes())
            .decompress()
            .ok_or_else(|| CryptoError::InvalidPublicKey("point does not decompress".to_string()))?;
        Ok(X25519PublicKey::from(edwards.to_montgomery().to_bytes()))
    }

    /// Verify a signature
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        self.signing_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    /// Get Ed25519 public key bytes
    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get X25519 public key bytes
    pub fn dh_key_bytes(&self) -> [u8; 32] {
        *self.dh_key.as_bytes()
    }

    /// Ed25519 followed by X25519, 64 bytes; used as handshake associated data
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.signing_key_bytes());
        bytes[32..].copy_from_slice(&self.dh_key_bytes());
        bytes
    }

    /// SHA-256 over [`Self::to_bytes`]
    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }
}
