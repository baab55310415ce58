//! Persistent storage on sled
//!
//! One database with these trees:
//! - `sessions`: contact id -> [`SessionRecord`]
//! - `handshakes`: contact id -> accepted handshake ephemeral keys
//! - `envelopes`: message id -> [`OutboundEnvelope`]
//! - `envelope_status`: status tag || message id -> ()
//! - `offline`: message id -> [`OfflineEntry`]
//! - `offline_expiry`: expires_at (be) || message id -> ()
//!
//! Writes are flushed before returning.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};

use courier_crypto::keys::PublicKeyBytes;

use crate::envelope::{DeliveryStatus, OutboundEnvelope};
use crate::error::Result;
use crate::offline::OfflineEntry;
use crate::session::SessionRecord;
use crate::storage::{EnvelopeStore, OfflineStore, SessionStore};
use crate::types::{ContactId, MessageId, Timestamp};
use crate::MAX_ACCEPTED_HANDSHAKES;

/// Sled-backed implementation of every courier store
pub struct SledStorage {
    db: Db,
    sessions: Tree,
    handshakes: Tree,
    envelopes: Tree,
    status_index: Tree,
    offline: Tree,
    expiry_index: Tree,
}

impl SledStorage {
    /// Open or create storage at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// Storage removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self> {
        let storage = Self {
            sessions: db.open_tree("sessions")?,
            handshakes: db.open_tree("handshakes")?,
            envelopes: db.open_tree("envelopes")?,
            status_index: db.open_tree("envelope_status")?,
            offline: db.open_tree("offline")?,
            expiry_index: db.open_tree("offline_expiry")?,
            db,
        };
        info!(
            sessions = storage.sessions.len(),
            envelopes = storage.envelopes.len(),
            offline = storage.offline.len(),
            "Opened courier storage"
        );
        Ok(storage)
    }

    fn expiry_key(entry: &OfflineEntry) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&entry.expires_at.to_be_bytes());
        key.extend_from_slice(entry.message_id.as_bytes());
        key
    }

    fn status_key(status: DeliveryStatus, message_id: &MessageId) -> Vec<u8> {
        let mut key = Vec::with_capacity(17);
        key.push(status_tag(status));
        key.extend_from_slice(message_id.as_bytes());
        key
    }

    fn accepted_handshakes(&self, contact_id: &ContactId) -> Result<Vec<PublicKeyBytes>> {
        match self.handshakes.get(contact_id.as_str().as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SledStorage {
    async fn load_session(&self, contact_id: &ContactId) -> Result<Option<SessionRecord>> {
        match self.sessions.get(contact_id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(SessionRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn save_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions
            .insert(session.contact_id.as_str().as_bytes(), session.to_bytes()?)?;
        self.flush()
    }

    async fn delete_session(&self, contact_id: &ContactId) -> Result<bool> {
        let removed = self.sessions.remove(contact_id.as_str().as_bytes())?.is_some();
        self.flush()?;
        Ok(removed)
    }

    async fn list_sessions(&self) -> Result<Vec<ContactId>> {
        self.sessions
            .iter()
            .keys()
            .map(|key| -> Result<ContactId> {
                let key = key?;
                Ok(ContactId::from_string(String::from_utf8_lossy(&key).into_owned()))
            })
            .collect()
    }

    async fn handshake_seen(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<bool> {
        Ok(self.accepted_handshakes(contact_id)?.contains(ephemeral_key))
    }

    async fn record_handshake(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<()> {
        let mut seen = self.accepted_handshakes(contact_id)?;
        if seen.contains(ephemeral_key) {
            return Ok(());
        }
        seen.push(ephemeral_key.clone());
        let excess = seen.len().saturating_sub(MAX_ACCEPTED_HANDSHAKES);
        seen.drain(..excess);
        self.handshakes
            .insert(contact_id.as_str().as_bytes(), bincode::serialize(&seen)?)?;
        self.flush()
    }
}

#[async_trait]
impl OfflineStore for SledStorage {
    async fn enqueue(&self, entry: OfflineEntry) -> Result<OfflineEntry> {
        let stored = match self.offline.get(entry.message_id.as_bytes())? {
            Some(bytes) => {
                let mut existing = OfflineEntry::from_bytes(&bytes)?;
                existing.merge(entry);
                existing
            }
            None => entry,
        };

        // Index first, so a crash never leaves an entry the purge cannot find
        self.expiry_index
            .insert(Self::expiry_key(&stored), Vec::<u8>::new())?;
        self.offline
            .insert(stored.message_id.as_bytes(), stored.to_bytes()?)?;
        self.flush()?;

        debug!(message_id = %stored.message_id, "Queued offline entry");
        Ok(stored)
    }

    async fn dequeue_deliverable(&self, contact_id: &ContactId) -> Result<Vec<OfflineEntry>> {
        let now = Timestamp::now();
        let mut entries = Vec::new();
        for item in self.offline.iter().values() {
            let entry = OfflineEntry::from_bytes(&item?)?;
            if &entry.contact_id == contact_id && !entry.is_expired_at(now) {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| (e.enqueued_at, e.message_id));
        Ok(entries)
    }

    async fn get(&self, message_id: &MessageId) -> Result<Option<OfflineEntry>> {
        match self.offline.get(message_id.as_bytes())? {
            Some(bytes) => Ok(Some(OfflineEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, message_id: &MessageId) -> Result<bool> {
        let Some(bytes) = self.offline.remove(message_id.as_bytes())? else {
            return Ok(false);
        };
        match OfflineEntry::from_bytes(&bytes) {
            Ok(entry) => {
                self.expiry_index.remove(Self::expiry_key(&entry))?;
            }
            Err(e) => warn!(%message_id, "Removed unreadable offline entry: {}", e),
        }
        self.flush()?;
        Ok(true)
    }

    async fn purge_expired_entries(&self, now: Timestamp) -> Result<Vec<OfflineEntry>> {
        let upper = Timestamp::from_millis(now.as_millis().saturating_add(1)).to_be_bytes();
        let mut purged = Vec::new();

        for item in self.expiry_index.range(..&upper[..]) {
            let (key, _) = item?;
            if key.len() == 24 {
                let message_id = MessageId::from_slice(&key[8..])?;
                if let Some(bytes) = self.offline.remove(message_id.as_bytes())? {
                    purged.push(OfflineEntry::from_bytes(&bytes)?);
                }
            }
            self.expiry_index.remove(key)?;
        }

        if !purged.is_empty() {
            self.flush()?;
            info!("Purged {} expired offline entries", purged.len());
        }
        Ok(purged)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.offline.len())
    }
}

#[async_trait]
impl EnvelopeStore for SledStorage {
    async fn save_envelope(&self, envelope: &OutboundEnvelope) -> Result<()> {
        let key = Self::status_key(envelope.status, &envelope.message_id);
        self.status_index.insert(key.clone(), Vec::<u8>::new())?;

        let previous = self
            .envelopes
            .insert(envelope.message_id.as_bytes(), envelope.to_bytes()?)?;
        if let Some(bytes) = previous {
            let old = OutboundEnvelope::from_bytes(&bytes)?;
            let old_key = Self::status_key(old.status, &old.message_id);
            if old_key != key {
                self.status_index.remove(old_key)?;
            }
        }
        self.flush()
    }

    async fn load_envelope(&self, message_id: &MessageId) -> Result<Option<OutboundEnvelope>> {
        match self.envelopes.get(message_id.as_bytes())? {
            Some(bytes) => Ok(Some(OutboundEnvelope::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn envelopes_with_status(
        &self,
        statuses: &[DeliveryStatus],
    ) -> Result<Vec<OutboundEnvelope>> {
        let mut envelopes = Vec::new();
        for &status in statuses {
            for item in self.status_index.scan_prefix([status_tag(status)]) {
                let (key, _) = item?;
                let message_id = MessageId::from_slice(&key[1..])?;
                // The index is written ahead of the record; trust the record
                match self.load_envelope(&message_id).await? {
                    Some(envelope) if envelope.status == status => envelopes.push(envelope),
                    _ => {
                        self.status_index.remove(key)?;
                    }
                }
            }
        }
        envelopes.sort_by_key(|e| (e.created_at, e.message_id));
        Ok(envelopes)
    }

    async fn delete_envelope(&self, message_id: &MessageId) -> Result<()> {
        if let Some(bytes) = self.envelopes.remove(message_id.as_bytes())? {
            let envelope = OutboundEnvelope::from_bytes(&bytes)?;
            self.status_index
                .remove(Self::status_key(envelope.status, message_id))?;
        }
        self.flush()
    }
}

fn status_tag(status: DeliveryStatus) -> u8 {
    match status {
        DeliveryStatus::Pending => 0,
        DeliveryStatus::InFlightDirect => 1,
        DeliveryStatus::InFlightRelay => 2,
        DeliveryStatus::Delivered => 3,
        DeliveryStatus::QueuedOffline => 4,
        DeliveryStatus::Failed => 5,
    }
}
