//! Bytes on the wire
//!
//! A [`WireEnvelope`] is what every path carries: Direct, Relay and the
//! store-and-forward deposit all move the same encoding, so the receiver
//! handles them identically.

use serde::{Deserialize, Serialize};

use courier_core::{ContactId, MessageId};
use courier_crypto::ratchet::RatchetMessage;
use courier_crypto::x3dh::X3DHHeader;
use courier_crypto::{MAX_MESSAGE_SIZE, PROTOCOL_VERSION};

use crate::error::{DeliveryError, Result};

/// Room for headers and the AEAD tag on top of the plaintext limit
const ENVELOPE_OVERHEAD: usize = 1024;

/// Output of the ratchet engine's seal
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedPayload {
    /// Present until the contact has answered our handshake
    pub handshake: Option<X3DHHeader>,
    /// The ratchet message
    pub message: RatchetMessage,
}

/// Versioned envelope around a sealed payload
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Protocol version
    pub version: u32,
    /// Sender-assigned id, stable across retries and paths
    pub message_id: MessageId,
    /// Sender contact id
    pub sender: ContactId,
    /// Encrypted content
    pub sealed: SealedPayload,
}

impl WireEnvelope {
    /// Wrap a sealed payload
    pub fn new(message_id: MessageId, sender: ContactId, sealed: SealedPayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id,
            sender,
            sealed,
        }
    }

    /// Serialize for transmission
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| DeliveryError::InvalidEnvelope(e.to_string()))
    }

    /// Parse received bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_MESSAGE_SIZE + ENVELOPE_OVERHEAD {
            return Err(DeliveryError::InvalidEnvelope(format!(
                "{} bytes exceeds limit",
                bytes.len()
            )));
        }

        let envelope: Self =
            bincode::deserialize(bytes).map_err(|e| DeliveryError::InvalidEnvelope(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(DeliveryError::InvalidEnvelope(format!(
                "unsupported version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}
