//! Error types for courier core

use thiserror::Error;

use crate::envelope::DeliveryStatus;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] courier_crypto::CryptoError),

    /// Contact identifier could not be derived or parsed
    #[error("Invalid contact id: {0}")]
    InvalidContactId(String),

    /// Message identifier could not be parsed
    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    /// Envelope status change not allowed by the delivery state machine
    #[error("Message {message_id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// The envelope
        message_id: String,
        /// Current status
        from: DeliveryStatus,
        /// Requested status
        to: DeliveryStatus,
    },

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
