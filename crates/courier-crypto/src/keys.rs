//! Key types shared by the handshake and the ratchet
//!
//! - Ephemeral X25519 key pairs for one-off Diffie-Hellman
//! - Signed and one-time prekeys published in a [`PreKeyBundle`]
//! - [`PublicKeyBytes`], the serializable form of an X25519 public key

use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// Size of X25519 public keys in bytes
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// An X25519 key pair used once and thrown away
pub struct EphemeralKeyPair {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral key pair
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from stored secret bytes
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = X25519StaticSecret::from(bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Get the public key in serializable form
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        PublicKeyBytes::from_x25519(&self.public)
    }

    /// Perform X25519 Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(their_public);
        SharedSecret(*shared.as_bytes())
    }

    /// Secret bytes, for ratchet state persistence only
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

impl Clone for EphemeralKeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret.to_bytes())
    }
}

/// A shared secret derived from Diffie-Hellman key exchange
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(pub(crate) [u8; 32]);

impl SharedSecret {
    /// Create a shared secret from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the secret bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for SharedSecret {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Serializable X25519 public key
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKeyBytes(#[serde(with = "hex::serde")] pub [u8; 32]);

impl PublicKeyBytes {
    /// Create from X25519 public key
    pub fn from_x25519(key: &X25519PublicKey) -> Self {
        Self(*key.as_bytes())
    }

    /// Public half of an X25519 secret
    pub fn from_secret(secret: &X25519StaticSecret) -> Self {
        Self::from_x25519(&X25519PublicKey::from(secret))
    }

    /// Convert to X25519 public key
    pub fn to_x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for PublicKeyBytes {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<X25519PublicKey> for PublicKeyBytes {
    fn from(key: X25519PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// Medium-term prekey signed by the owner's identity key
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// The pre-key ID
    pub id: u32,
    /// The public key
    pub public_key: PublicKeyBytes,
    /// Ed25519 signature over the public key
    #[serde(with = "hex::serde")]
    pub signature: [u8; 64],
    /// Creation time (seconds since epoch)
    pub timestamp: i64,
}

impl SignedPreKey {
    /// Verify the signature using the identity public key
    pub fn verify(&self, identity_key: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_bytes(&self.signature);
        identity_key
            .verify_strict(self.public_key.as_bytes(), &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// One-time prekey, consumed by the first handshake that names it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// The key ID
    pub id: u32,
    /// The public key
    pub public_key: PublicKeyBytes,
}

/// Everything an initiator needs to open a session with an offline peer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Identity public key (Ed25519)
    #[serde(with = "hex::serde")]
    pub identity_key: [u8; 32],
    /// Signed pre-key
    pub signed_prekey: SignedPreKey,
    /// One-time pre-key, absent when the pool ran dry
    pub one_time_prekey: Option<OneTimePreKey>,
}
