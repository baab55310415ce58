//! Per-contact session records
//!
//! A [`SessionRecord`] is the persisted form of one Double Ratchet session.
//! It is created by the first successful handshake with a contact, rewritten
//! after every seal and unseal, and removed only by an explicit reset.

use serde::{Deserialize, Serialize};

use courier_crypto::keys::PublicKeyBytes;
use courier_crypto::ratchet::RatchetState;
use courier_crypto::x3dh::X3DHHeader;

use crate::error::Result;
use crate::types::{ContactId, Timestamp};

/// An initiated handshake the peer has not answered yet
///
/// While present, every sealed payload carries `header` so the peer can
/// rebuild the session from whichever message reaches it first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeState {
    /// Header attached to outgoing messages
    pub header: X3DHHeader,
    /// When the handshake was started
    pub initiated_at: Timestamp,
}

/// Persisted session with one contact
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The contact this session talks to
    pub contact_id: ContactId,
    /// Contact's Ed25519 identity key as of the handshake
    #[serde(with = "hex::serde")]
    pub their_identity_key: [u8; 32],
    /// Ratchet state (root key, chain keys, counters)
    pub ratchet: RatchetState,
    /// Our unacknowledged handshake, if we initiated
    pub pending_handshake: Option<HandshakeState>,
    /// Ephemeral key of the peer handshake this session answered, if we responded
    pub accepted_handshake: Option<PublicKeyBytes>,
    /// Creation time
    pub created_at: Timestamp,
    /// Last update time
    pub updated_at: Timestamp,
}

impl SessionRecord {
    /// Session we opened from the contact's prekey bundle
    pub fn initiated(
        contact_id: ContactId,
        their_identity_key: [u8; 32],
        ratchet: RatchetState,
        header: X3DHHeader,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            contact_id,
            their_identity_key,
            ratchet,
            pending_handshake: Some(HandshakeState {
                header,
                initiated_at: now,
            }),
            accepted_handshake: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Session built from the contact's handshake header
    pub fn accepted(
        contact_id: ContactId,
        their_identity_key: [u8; 32],
        ratchet: RatchetState,
        their_ephemeral: PublicKeyBytes,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            contact_id,
            their_identity_key,
            ratchet,
            pending_handshake: None,
            accepted_handshake: Some(their_ephemeral),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether we initiated and the contact has not replied yet
    pub fn is_awaiting_response(&self) -> bool {
        self.pending_handshake.is_some()
    }

    /// Whether this session was built from the given peer handshake
    pub fn answered(&self, their_ephemeral: &PublicKeyBytes) -> bool {
        self.accepted_handshake.as_ref() == Some(their_ephemeral)
    }

    /// Mark the handshake complete after the first reply decrypted
    pub fn confirm_handshake(&mut self) {
        self.pending_handshake = None;
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Timestamp::now();
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Plain-data summary for callers outside the engine
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            contact_id: self.contact_id.clone(),
            fingerprint: hex::encode(self.ratchet.state_fingerprint()),
            awaiting_response: self.is_awaiting_response(),
            created_at: self.created_at,
        }
    }
}

/// Read-only description of a session; carries no key material
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// The contact
    pub contact_id: ContactId,
    /// Hash of the public ratchet position
    pub fingerprint: String,
    /// Whether our handshake is still unanswered
    pub awaiting_response: bool,
    /// Creation time
    pub created_at: Timestamp,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use courier_crypto::identity::IdentityKeyPair;
    use courier_crypto::x3dh::{PreKeyManager, X3DHKeyAgreement};

    /// An initiator-side record for storage tests
    pub(crate) fn sample_session() -> SessionRecord {
        let ours = IdentityKeyPair::generate();
        let mut theirs = PreKeyManager::new(IdentityKeyPair::generate(), 1);
        let bundle = theirs.issue_bundle();
        let (secret, header) = X3DHKeyAgreement::initiate(&ours, &bundle).unwrap();
        let ratchet =
            RatchetState::init_initiator(&secret, &bundle.signed_prekey.public_key, 1000).unwrap();

        SessionRecord::initiated(
            ContactId::from_identity_key(&bundle.identity_key).unwrap(),
            bundle.identity_key,
            ratchet,
            header,
        )
    }

    #[test]
    fn test_record_roundtrips_through_bytes() {
        let mut session = sample_session();
        session.ratchet.encrypt(b"advance").unwrap();

        let restored = SessionRecord::from_bytes(&session.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.contact_id, session.contact_id);
        assert_eq!(restored.ratchet.sending_message_number(), 1);
        assert_eq!(restored.handle(), session.handle());
    }

    #[test]
    fn test_handshake_confirmation() {
        let mut session = sample_session();
        assert!(session.is_awaiting_response());
        assert!(session.handle().awaiting_response);

        session.confirm_handshake();
        assert!(!session.is_awaiting_response());
    }
}
