//! Authenticated Encryption with Associated Data (AEAD)
//!
//! Message keys from the ratchet are single-use, so nonces are random per
//! call. XChaCha20-Poly1305 is the default; AES-256-GCM is accepted on
//! decrypt for peers that prefer hardware AES.

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    Aes256Gcm,
};
use chacha20poly1305::XChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};
use crate::MAX_MESSAGE_SIZE;

/// Nonce size for XChaCha20-Poly1305 (192 bits)
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Nonce size for AES-256-GCM (96 bits)
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits)
pub const TAG_SIZE: usize = 16;

/// Key size for both algorithms (256 bits)
pub const KEY_SIZE: usize = 32;

/// AEAD key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Nonce, tagged by algorithm
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nonce {
    /// XChaCha20-Poly1305 nonce (24 bytes)
    XChaCha([u8; XCHACHA_NONCE_SIZE]),
    /// AES-GCM nonce (12 bytes)
    AesGcm([u8; AES_GCM_NONCE_SIZE]),
}

impl Nonce {
    fn random(algorithm: AeadAlgorithm) -> Self {
        let mut rng = rand::thread_rng();
        match algorithm {
            AeadAlgorithm::XChaCha20Poly1305 => {
                let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
                rng.fill_bytes(&mut nonce);
                Nonce::XChaCha(nonce)
            }
            AeadAlgorithm::Aes256Gcm => {
                let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
                rng.fill_bytes(&mut nonce);
                Nonce::AesGcm(nonce)
            }
        }
    }

    /// Get nonce bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Nonce::XChaCha(n) => n,
            Nonce::AesGcm(n) => n,
        }
    }
}

/// AEAD algorithm selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    /// XChaCha20-Poly1305
    #[default]
    XChaCha20Poly1305,
    /// AES-256-GCM
    Aes256Gcm,
}

/// Ciphertext plus the nonce needed to open it
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// The nonce; its variant names the algorithm
    pub nonce: Nonce,
    /// The ciphertext with authentication tag
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Get the plaintext length (without tag)
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(TAG_SIZE)
    }
}

/// AEAD cipher for message encryption
#[derive(Clone, Copy, Debug, Default)]
pub struct Aead {
    algorithm: AeadAlgorithm,
}

impl Aead {
    /// Cipher using the default algorithm
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a specific algorithm
    pub fn with_algorithm(algorithm: AeadAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Encrypt plaintext, authenticating `aad` alongside it
    pub fn encrypt(&self, key: &AeadKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedPayload> {
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(CryptoError::MessageTooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let nonce = Nonce::random(self.algorithm);
        let payload = Payload { msg: plaintext, aad };
        let ciphertext = match &nonce {
            Nonce::XChaCha(n) => XChaCha20Poly1305::new(key.as_bytes().into())
                .encrypt(n.into(), payload)
                .map_err(|_| CryptoError::EncryptionFailed("XChaCha20-Poly1305".to_string()))?,
            Nonce::AesGcm(n) => Aes256Gcm::new(key.as_bytes().into())
                .encrypt(n.into(), payload)
                .map_err(|_| CryptoError::EncryptionFailed("AES-256-GCM".to_string()))?,
        };

        Ok(EncryptedPayload { nonce, ciphertext })
    }

    /// Decrypt a payload; any tag mismatch is [`CryptoError::AuthenticationFailed`]
    pub fn decrypt(&self, key: &AeadKey, payload: &EncryptedPayload, aad: &[u8]) -> Result<Vec<u8>> {
        let body = Payload {
            msg: &payload.ciphertext,
            aad,
        };
        match &payload.nonce {
            Nonce::XChaCha(n) => XChaCha20Poly1305::new(key.as_bytes().into()).decrypt(n.into(), body),
            Nonce::AesGcm(n) => Aes256Gcm::new(key.as_bytes().into()).decrypt(n.into(), body),
        }
        .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
