//! Delivery error types

use thiserror::Error;

use courier_core::{ContactId, DeliveryStatus, MessageId};
use courier_crypto::CryptoError;

use crate::transport::TransportError;

/// Result type alias
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery errors
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Prekey material was missing, forged or did not belong to the contact
    #[error("Handshake with {contact} failed: {reason}")]
    Handshake {
        /// The contact
        contact: ContactId,
        /// What was wrong
        reason: String,
    },

    /// No session and no prekey bundle to start one
    #[error("No session with {0} and no prekey bundle available")]
    NoSession(ContactId),

    /// Payload failed authentication; tampered or desynced
    #[error("Could not decrypt message from {contact}: {reason}")]
    Decryption {
        /// The sender
        contact: ContactId,
        /// Underlying failure
        reason: String,
    },

    /// Message lies outside the skip window
    #[error("Session with {contact} desynced: {gap} messages skipped, window is {max}")]
    TooManySkippedMessages {
        /// The sender
        contact: ContactId,
        /// Distance from the current chain position
        gap: u32,
        /// Configured window
        max: u32,
    },

    /// The message key was already used
    #[error("Message {message_number} from {contact} already processed")]
    Replay {
        /// The sender
        contact: ContactId,
        /// Position in the sender's chain
        message_number: u32,
    },

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(courier_core::Error),

    /// Keystore could not supply key material
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// Bytes were not a wire envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// No envelope with this id
    #[error("Unknown message {0}")]
    UnknownMessage(MessageId),

    /// Status change not allowed by the delivery state machine
    #[error("Message {message_id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// The envelope
        message_id: String,
        /// Current status
        from: DeliveryStatus,
        /// Requested status
        to: DeliveryStatus,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Crypto error outside the taxonomy above
    #[error("Crypto error: {0}")]
    Crypto(CryptoError),
}

impl DeliveryError {
    /// Classify a crypto failure in a session with `contact`
    pub fn from_crypto(contact: &ContactId, err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => {
                DeliveryError::Decryption {
                    contact: contact.clone(),
                    reason: err.to_string(),
                }
            }
            CryptoError::MessageGapTooLarge { gap, max } => DeliveryError::TooManySkippedMessages {
                contact: contact.clone(),
                gap,
                max,
            },
            CryptoError::ReplayDetected { message_number } => DeliveryError::Replay {
                contact: contact.clone(),
                message_number,
            },
            CryptoError::InvalidSignature
            | CryptoError::InvalidPublicKey(_)
            | CryptoError::PrekeyNotFound(_) => DeliveryError::Handshake {
                contact: contact.clone(),
                reason: err.to_string(),
            },
            other => DeliveryError::Crypto(other),
        }
    }

    /// Shorthand for a handshake failure
    pub fn handshake(contact: &ContactId, reason: impl Into<String>) -> Self {
        DeliveryError::Handshake {
            contact: contact.clone(),
            reason: reason.into(),
        }
    }
}

impl From<courier_core::Error> for DeliveryError {
    fn from(err: courier_core::Error) -> Self {
        match err {
            courier_core::Error::InvalidTransition {
                message_id,
                from,
                to,
            } => DeliveryError::InvalidTransition {
                message_id,
                from,
                to,
            },
            other => DeliveryError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_failures_map_to_taxonomy() {
        let bob = ContactId::from("bob");

        assert!(matches!(
            DeliveryError::from_crypto(&bob, CryptoError::AuthenticationFailed),
            DeliveryError::Decryption { .. }
        ));
        assert!(matches!(
            DeliveryError::from_crypto(&bob, CryptoError::MessageGapTooLarge { gap: 2000, max: 1000 }),
            DeliveryError::TooManySkippedMessages { gap: 2000, max: 1000, .. }
        ));
        assert!(matches!(
            DeliveryError::from_crypto(&bob, CryptoError::InvalidSignature),
            DeliveryError::Handshake { .. }
        ));
        assert!(matches!(
            DeliveryError::from_crypto(&bob, CryptoError::ReplayDetected { message_number: 4 }),
            DeliveryError::Replay { message_number: 4, .. }
        ));
        assert!(matches!(
            DeliveryError::from_crypto(&bob, CryptoError::RatchetCorrupted("x".into())),
            DeliveryError::Crypto(_)
        ));
    }

    #[test]
    fn test_invalid_transition_keeps_its_shape() {
        let err: DeliveryError = courier_core::Error::InvalidTransition {
            message_id: "m".into(),
            from: DeliveryStatus::Delivered,
            to: DeliveryStatus::Pending,
        }
        .into();
        assert!(matches!(err, DeliveryError::InvalidTransition { .. }));
    }
}
