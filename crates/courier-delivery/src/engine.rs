//! Ratchet engine
//!
//! The only component that touches ratchet state. Every operation on a
//! contact's session runs under that contact's lock, loads the persisted
//! record, mutates it and writes it back before the lock is released.
//! Different contacts never contend.
//!
//! Handshakes are implicit: sealing to a contact with no session runs X3DH
//! against their cached prekey bundle, and the resulting header rides along
//! on every message until the contact answers. A handshake is accepted at
//! most once per contact, so a recorded one cannot be replayed to replace a
//! live session.
//!
//! The message id and sender travel outside the ciphertext, so both are
//! authenticated as part of the ratchet's associated data.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use courier_core::session::SessionHandle;
use courier_core::storage::SessionStore;
use courier_core::{ContactId, MessageId, SessionRecord};
use courier_crypto::identity::IdentityKeyPair;
use courier_crypto::keys::PreKeyBundle;
use courier_crypto::ratchet::{RatchetMessage, RatchetState};
use courier_crypto::x3dh::{X3DHHeader, X3DHKeyAgreement};

use crate::error::{DeliveryError, Result};
use crate::keystore::Keystore;
use crate::wire::SealedPayload;

/// What an unseal did to the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionChange {
    /// Existing session advanced
    Unchanged,
    /// First session with this contact, built from their handshake
    Established,
    /// A previous session was discarded for the contact's new handshake
    Replaced,
}

/// Result of a successful unseal
#[derive(Debug)]
pub struct Unsealed {
    /// Decrypted content
    pub plaintext: Vec<u8>,
    /// Effect on the session
    pub session: SessionChange,
}

/// Handshake and seal/unseal over persisted sessions
pub struct RatchetEngine {
    identity: IdentityKeyPair,
    own_id: ContactId,
    keystore: Arc<dyn Keystore>,
    sessions: Arc<dyn SessionStore>,
    locks: DashMap<ContactId, Arc<Mutex<()>>>,
    max_skip: u32,
}

impl RatchetEngine {
    /// Create an engine; loads our identity once
    pub fn new(
        keystore: Arc<dyn Keystore>,
        sessions: Arc<dyn SessionStore>,
        max_skip: u32,
    ) -> Result<Self> {
        let identity = keystore.load_identity_key()?;
        let own_id = ContactId::from_identity_key(&identity.public_key_bytes())
            .map_err(|e| DeliveryError::Keystore(e.to_string()))?;

        Ok(Self {
            identity,
            own_id,
            keystore,
            sessions,
            locks: DashMap::new(),
            max_skip,
        })
    }

    /// Our contact id
    pub fn own_id(&self) -> &ContactId {
        &self.own_id
    }

    fn lock_for(&self, contact_id: &ContactId) -> Arc<Mutex<()>> {
        self.locks
            .entry(contact_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run X3DH against `bundle` and persist the new session
    ///
    /// Replaces any existing session with the contact.
    #[instrument(skip(self, bundle), fields(contact = %contact_id))]
    pub async fn initiate_session(
        &self,
        contact_id: &ContactId,
        bundle: &PreKeyBundle,
    ) -> Result<SessionHandle> {
        let lock = self.lock_for(contact_id);
        let _guard = lock.lock().await;

        let session = self.handshake(contact_id, bundle)?;
        self.sessions.save_session(&session).await?;

        info!("Initiated session");
        Ok(session.handle())
    }

    /// Encrypt for a contact, starting a session from the cached bundle if needed
    #[instrument(skip(self, plaintext), fields(contact = %contact_id))]
    pub async fn seal(
        &self,
        contact_id: &ContactId,
        message_id: MessageId,
        plaintext: &[u8],
    ) -> Result<SealedPayload> {
        let lock = self.lock_for(contact_id);
        let _guard = lock.lock().await;

        let mut session = match self.sessions.load_session(contact_id).await? {
            Some(session) => session,
            None => {
                let bundle = self
                    .keystore
                    .load_prekey_bundle(contact_id)
                    .ok_or_else(|| DeliveryError::NoSession(contact_id.clone()))?;
                info!("No session, starting handshake from cached bundle");
                self.handshake(contact_id, &bundle)?
            }
        };

        let message = session
            .ratchet
            .encrypt_bound(plaintext, &binding(message_id, &self.own_id))
            .map_err(|e| DeliveryError::from_crypto(contact_id, e))?;
        let handshake = session.pending_handshake.as_ref().map(|h| h.header.clone());

        session.touch();
        self.sessions.save_session(&session).await?;

        debug!(n = message.header.message_number, "Sealed");
        Ok(SealedPayload { handshake, message })
    }

    /// Decrypt a payload from a contact
    ///
    /// A payload carrying a handshake either continues the session that
    /// answered it or builds a responder session. When both sides initiated
    /// at once, the side with the lower identity key keeps its own session
    /// and rejects the other's handshake. A handshake accepted before is
    /// rejected, even after the session it built was reset.
    #[instrument(skip(self, sealed), fields(contact = %contact_id))]
    pub async fn unseal(
        &self,
        contact_id: &ContactId,
        message_id: MessageId,
        sealed: &SealedPayload,
    ) -> Result<Unsealed> {
        let lock = self.lock_for(contact_id);
        let _guard = lock.lock().await;

        let context = binding(message_id, contact_id);

        let existing = self.sessions.load_session(contact_id).await?;
        let (header, change) = match (&sealed.handshake, existing) {
            (None, Some(mut session)) => {
                let plaintext = self.open(contact_id, &mut session, &sealed.message, &context)?;
                if session.is_awaiting_response() {
                    info!("Handshake confirmed");
                    session.confirm_handshake();
                }
                self.sessions.save_session(&session).await?;
                return Ok(Unsealed {
                    plaintext,
                    session: SessionChange::Unchanged,
                });
            }
            (None, None) => return Err(DeliveryError::NoSession(contact_id.clone())),
            (Some(header), Some(mut session)) if session.answered(&header.ephemeral_key) => {
                let plaintext = self.open(contact_id, &mut session, &sealed.message, &context)?;
                self.sessions.save_session(&session).await?;
                return Ok(Unsealed {
                    plaintext,
                    session: SessionChange::Unchanged,
                });
            }
            (Some(header), Some(session)) => {
                if session.is_awaiting_response() && self.wins_tie_break(header) {
                    warn!("Simultaneous handshake, keeping ours");
                    return Err(DeliveryError::handshake(
                        contact_id,
                        "simultaneous handshake resolved in favour of our session",
                    ));
                }
                (header, SessionChange::Replaced)
            }
            (Some(header), None) => (header, SessionChange::Established),
        };

        if self
            .sessions
            .handshake_seen(contact_id, &header.ephemeral_key)
            .await?
        {
            warn!("Handshake already accepted once");
            return Err(DeliveryError::handshake(contact_id, "handshake was already accepted"));
        }

        let mut session = self.accept(contact_id, header)?;
        let plaintext = self.open(contact_id, &mut session, &sealed.message, &context)?;
        self.sessions.save_session(&session).await?;
        self.sessions
            .record_handshake(contact_id, &header.ephemeral_key)
            .await?;

        if let Some(id) = header.one_time_prekey_id {
            self.keystore.consume_one_time_prekey(id);
        }

        match change {
            SessionChange::Replaced => info!("Replaced session from new handshake"),
            _ => info!("Accepted handshake"),
        }
        Ok(Unsealed {
            plaintext,
            session: change,
        })
    }

    /// Drop the session; the next seal starts a fresh handshake
    #[instrument(skip(self), fields(contact = %contact_id))]
    pub async fn reset_session(&self, contact_id: &ContactId) -> Result<bool> {
        let lock = self.lock_for(contact_id);
        let _guard = lock.lock().await;

        let removed = self.sessions.delete_session(contact_id).await?;
        if removed {
            info!("Session reset");
        }
        Ok(removed)
    }

    /// Whether a session with the contact exists
    pub async fn has_session(&self, contact_id: &ContactId) -> Result<bool> {
        Ok(self.sessions.load_session(contact_id).await?.is_some())
    }

    /// Describe the session with a contact
    pub async fn session(&self, contact_id: &ContactId) -> Result<Option<SessionHandle>> {
        Ok(self
            .sessions
            .load_session(contact_id)
            .await?
            .map(|s| s.handle()))
    }

    fn handshake(&self, contact_id: &ContactId, bundle: &PreKeyBundle) -> Result<SessionRecord> {
        if !contact_id.matches_identity(&bundle.identity_key) {
            return Err(DeliveryError::handshake(
                contact_id,
                "prekey bundle identity does not match contact",
            ));
        }

        let (secret, header) = X3DHKeyAgreement::initiate(&self.identity, bundle)
            .map_err(|e| DeliveryError::handshake(contact_id, e.to_string()))?;
        let ratchet =
            RatchetState::init_initiator(&secret, &bundle.signed_prekey.public_key, self.max_skip)
                .map_err(|e| DeliveryError::handshake(contact_id, e.to_string()))?;

        Ok(SessionRecord::initiated(
            contact_id.clone(),
            bundle.identity_key,
            ratchet,
            header,
        ))
    }

    fn accept(&self, contact_id: &ContactId, header: &X3DHHeader) -> Result<SessionRecord> {
        if !contact_id.matches_identity(&header.identity_key) {
            return Err(DeliveryError::handshake(
                contact_id,
                "handshake identity does not match sender",
            ));
        }

        let signed_prekey = self
            .keystore
            .signed_prekey(header.signed_prekey_id)
            .ok_or_else(|| DeliveryError::handshake(contact_id, "unknown signed prekey"))?;
        let one_time_prekey = match header.one_time_prekey_id {
            Some(id) => Some(
                self.keystore
                    .one_time_prekey(id)
                    .ok_or_else(|| DeliveryError::handshake(contact_id, "one-time prekey already used"))?,
            ),
            None => None,
        };

        let secret = X3DHKeyAgreement::respond(
            &self.identity,
            &signed_prekey,
            one_time_prekey.as_ref(),
            header,
        )
        .map_err(|e| DeliveryError::handshake(contact_id, e.to_string()))?;
        let ratchet = RatchetState::init_responder(&secret, &signed_prekey, self.max_skip);

        Ok(SessionRecord::accepted(
            contact_id.clone(),
            header.identity_key,
            ratchet,
            header.ephemeral_key.clone(),
        ))
    }

    fn open(
        &self,
        contact_id: &ContactId,
        session: &mut SessionRecord,
        message: &RatchetMessage,
        context: &[u8],
    ) -> Result<Vec<u8>> {
        let plaintext = session
            .ratchet
            .decrypt_bound(message, context)
            .map_err(|e| DeliveryError::from_crypto(contact_id, e))?;
        session.touch();
        Ok(plaintext)
    }

    fn wins_tie_break(&self, their_header: &X3DHHeader) -> bool {
        self.identity.public_key_bytes() < their_header.identity_key
    }
}

/// Transport metadata authenticated alongside the ciphertext
fn binding(message_id: MessageId, sender: &ContactId) -> Vec<u8> {
    let mut context = Vec::with_capacity(16 + sender.as_str().len());
    context.extend_from_slice(message_id.as_bytes());
    context.extend_from_slice(sender.as_str().as_bytes());
    context
}
