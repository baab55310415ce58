//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// HKDF could not produce the requested output
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// Signed prekey signature does not verify
    #[error("Signed prekey signature does not verify")]
    InvalidSignature,

    /// AEAD refused to seal
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// AEAD tag mismatch: tampered payload or desynced keys
    #[error("Payload failed authentication")]
    AuthenticationFailed,

    /// Key bytes are not a usable curve point
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Plaintext above the protocol limit
    #[error("Plaintext of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// The key for this message was already consumed
    #[error("Message {message_number} already processed")]
    ReplayDetected { message_number: u32 },

    /// Message lies outside the skip window
    #[error("Message gap too large: {gap} messages skipped, window is {max}")]
    MessageGapTooLarge { gap: u32, max: u32 },

    /// Ratchet state cannot serve the request
    #[error("Ratchet state corrupted: {0}")]
    RatchetCorrupted(String),

    /// Persisted state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The handshake names a prekey we no longer hold
    #[error("Prekey not found: {0}")]
    PrekeyNotFound(String),
}

impl From<bincode::Error> for CryptoError {
    fn from(err: bincode::Error) -> Self {
        CryptoError::Serialization(err.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        CryptoError::InvalidSignature
    }
}
