//! Storage traits for courier
//!
//! Defines the persistence seams the delivery layer depends on. Every
//! implementation must make a write durable before the call returns, so a
//! restart observes exactly the state the last successful call left behind.

use async_trait::async_trait;

use courier_crypto::keys::PublicKeyBytes;

use crate::envelope::{DeliveryStatus, OutboundEnvelope};
use crate::error::Result;
use crate::offline::OfflineEntry;
use crate::session::SessionRecord;
use crate::types::{ContactId, MessageId, Timestamp};

/// Storage for ratchet sessions, one per contact
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Get the session with a contact
    async fn load_session(&self, contact_id: &ContactId) -> Result<Option<SessionRecord>>;

    /// Insert or replace the session with a contact
    async fn save_session(&self, session: &SessionRecord) -> Result<()>;

    /// Delete the session with a contact, returning whether one existed
    async fn delete_session(&self, contact_id: &ContactId) -> Result<bool>;

    /// Contacts that have a session
    async fn list_sessions(&self) -> Result<Vec<ContactId>>;

    /// Whether a handshake with this ephemeral key was accepted from the contact
    async fn handshake_seen(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<bool>;

    /// Remember an accepted handshake
    ///
    /// Kept independently of the session, so deleting the session does not
    /// forget it. Only the latest [`MAX_ACCEPTED_HANDSHAKES`] per contact are
    /// retained.
    ///
    /// [`MAX_ACCEPTED_HANDSHAKES`]: crate::MAX_ACCEPTED_HANDSHAKES
    async fn record_handshake(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<()>;
}

/// Durable queue of messages waiting for an offline recipient
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Queue an entry, or merge it into the one already stored for its message
    ///
    /// Returns the entry as stored.
    async fn enqueue(&self, entry: OfflineEntry) -> Result<OfflineEntry>;

    /// Unexpired entries for a contact, oldest first
    ///
    /// Entries stay queued until [`OfflineStore::remove`] is called.
    async fn dequeue_deliverable(&self, contact_id: &ContactId) -> Result<Vec<OfflineEntry>>;

    /// Get one entry
    async fn get(&self, message_id: &MessageId) -> Result<Option<OfflineEntry>>;

    /// Remove an entry, returning whether it was queued
    async fn remove(&self, message_id: &MessageId) -> Result<bool>;

    /// Remove and return every entry expired at `now`
    async fn purge_expired_entries(&self, now: Timestamp) -> Result<Vec<OfflineEntry>>;

    /// Remove expired entries, returning how many went
    async fn purge_expired(&self, now: Timestamp) -> Result<usize> {
        Ok(self.purge_expired_entries(now).await?.len())
    }

    /// Number of queued entries
    async fn len(&self) -> Result<usize>;
}

/// Storage for outbound envelopes
#[async_trait]
pub trait EnvelopeStore: Send + Sync {
    /// Insert or replace an envelope
    async fn save_envelope(&self, envelope: &OutboundEnvelope) -> Result<()>;

    /// Get an envelope
    async fn load_envelope(&self, message_id: &MessageId) -> Result<Option<OutboundEnvelope>>;

    /// Envelopes currently in any of `statuses`, oldest first
    async fn envelopes_with_status(
        &self,
        statuses: &[DeliveryStatus],
    ) -> Result<Vec<OutboundEnvelope>>;

    /// Delete an envelope
    async fn delete_envelope(&self, message_id: &MessageId) -> Result<()>;

    /// Delete Delivered and Failed envelopes last updated before `cutoff`
    ///
    /// Returns how many were removed.
    async fn purge_finished(&self, cutoff: Timestamp) -> Result<usize> {
        let finished = self
            .envelopes_with_status(&[DeliveryStatus::Delivered, DeliveryStatus::Failed])
            .await?;
        let mut removed = 0;
        for envelope in finished.iter().filter(|e| e.updated_at < cutoff) {
            self.delete_envelope(&envelope.message_id).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// In-memory storage implementation (for testing)
pub mod memory {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::{HashMap, VecDeque};

    use crate::MAX_ACCEPTED_HANDSHAKES;

    /// In-memory storage
    #[derive(Default)]
    pub struct MemoryStorage {
        sessions: RwLock<HashMap<ContactId, SessionRecord>>,
        handshakes: RwLock<HashMap<ContactId, VecDeque<PublicKeyBytes>>>,
        envelopes: RwLock<HashMap<MessageId, OutboundEnvelope>>,
        offline: RwLock<HashMap<MessageId, OfflineEntry>>,
    }

    impl MemoryStorage {
        /// Create new memory storage
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SessionStore for MemoryStorage {
        async fn load_session(&self, contact_id: &ContactId) -> Result<Option<SessionRecord>> {
            Ok(self.sessions.read().get(contact_id).cloned())
        }

        async fn save_session(&self, session: &SessionRecord) -> Result<()> {
            self.sessions
                .write()
                .insert(session.contact_id.clone(), session.clone());
            Ok(())
        }

        async fn delete_session(&self, contact_id: &ContactId) -> Result<bool> {
            Ok(self.sessions.write().remove(contact_id).is_some())
        }

        async fn list_sessions(&self) -> Result<Vec<ContactId>> {
            let mut contacts: Vec<_> = self.sessions.read().keys().cloned().collect();
            contacts.sort();
            Ok(contacts)
        }

        async fn handshake_seen(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<bool> {
            Ok(self
                .handshakes
                .read()
                .get(contact_id)
                .is_some_and(|seen| seen.contains(ephemeral_key)))
        }

        async fn record_handshake(&self, contact_id: &ContactId, ephemeral_key: &PublicKeyBytes) -> Result<()> {
            let mut handshakes = self.handshakes.write();
            let seen = handshakes.entry(contact_id.clone()).or_default();
            if !seen.contains(ephemeral_key) {
                seen.push_back(ephemeral_key.clone());
            }
            while seen.len() > MAX_ACCEPTED_HANDSHAKES {
                seen.pop_front();
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OfflineStore for MemoryStorage {
        async fn enqueue(&self, entry: OfflineEntry) -> Result<OfflineEntry> {
            let mut offline = self.offline.write();
            let stored = match offline.remove(&entry.message_id) {
                Some(mut existing) => {
                    existing.merge(entry);
                    existing
                }
                None => entry,
            };
            offline.insert(stored.message_id, stored.clone());
            Ok(stored)
        }

        async fn dequeue_deliverable(&self, contact_id: &ContactId) -> Result<Vec<OfflineEntry>> {
            let now = Timestamp::now();
            let mut entries: Vec<_> = self
                .offline
                .read()
                .values()
                .filter(|e| &e.contact_id == contact_id && !e.is_expired_at(now))
                .cloned()
                .collect();
            entries.sort_by_key(|e| (e.enqueued_at, e.message_id));
            Ok(entries)
        }

        async fn get(&self, message_id: &MessageId) -> Result<Option<OfflineEntry>> {
            Ok(self.offline.read().get(message_id).cloned())
        }

        async fn remove(&self, message_id: &MessageId) -> Result<bool> {
            Ok(self.offline.write().remove(message_id).is_some())
        }

        async fn purge_expired_entries(&self, now: Timestamp) -> Result<Vec<OfflineEntry>> {
            let mut offline = self.offline.write();
            let expired: Vec<MessageId> = offline
                .values()
                .filter(|e| e.is_expired_at(now))
                .map(|e| e.message_id)
                .collect();

            Ok(expired
                .iter()
                .filter_map(|id| offline.remove(id))
                .collect())
        }

        async fn len(&self) -> Result<usize> {
            Ok(self.offline.read().len())
        }
    }

    #[async_trait]
    impl EnvelopeStore for MemoryStorage {
        async fn save_envelope(&self, envelope: &OutboundEnvelope) -> Result<()> {
            self.envelopes
                .write()
                .insert(envelope.message_id, envelope.clone());
            Ok(())
        }

        async fn load_envelope(&self, message_id: &MessageId) -> Result<Option<OutboundEnvelope>> {
            Ok(self.envelopes.read().get(message_id).cloned())
        }

        async fn envelopes_with_status(
            &self,
            statuses: &[DeliveryStatus],
        ) -> Result<Vec<OutboundEnvelope>> {
            let mut envelopes: Vec<_> = self
                .envelopes
                .read()
                .values()
                .filter(|e| statuses.contains(&e.status))
                .cloned()
                .collect();
            envelopes.sort_by_key(|e| (e.created_at, e.message_id));
            Ok(envelopes)
        }

        async fn delete_envelope(&self, message_id: &MessageId) -> Result<()> {
            self.envelopes.write().remove(message_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStorage;
    use super::*;
    use crate::session::tests::sample_session;
    use std::time::Duration;

    fn entry_for(contact: &str, ttl_secs: u64) -> OfflineEntry {
        OfflineEntry::new(
            MessageId::new(),
            ContactId::from(contact),
            vec![0xAB; 16],
            Duration::from_secs(ttl_secs),
        )
    }

    #[tokio::test]
    async fn test_session_crud() {
        let storage = MemoryStorage::new();
        let session = sample_session();

        storage.save_session(&session).await.unwrap();
        let loaded = storage.load_session(&session.contact_id).await.unwrap();
        assert_eq!(loaded.unwrap().handle(), session.handle());
        assert_eq!(storage.list_sessions().await.unwrap(), vec![session.contact_id.clone()]);

        assert!(storage.delete_session(&session.contact_id).await.unwrap());
        assert!(!storage.delete_session(&session.contact_id).await.unwrap());
        assert!(storage.load_session(&session.contact_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handshakes_outlive_sessions_and_are_bounded() {
        let storage = MemoryStorage::new();
        let session = sample_session();
        let contact = session.contact_id.clone();
        let first = PublicKeyBytes([1; 32]);

        storage.save_session(&session).await.unwrap();
        storage.record_handshake(&contact, &first).await.unwrap();
        storage.delete_session(&contact).await.unwrap();
        assert!(storage.handshake_seen(&contact, &first).await.unwrap());
        assert!(!storage
            .handshake_seen(&ContactId::from("carol"), &first)
            .await
            .unwrap());

        for i in 0..crate::MAX_ACCEPTED_HANDSHAKES {
            let key = PublicKeyBytes([2; 32].map(|b: u8| b.wrapping_add(i as u8)));
            storage.record_handshake(&contact, &key).await.unwrap();
        }
        assert!(!storage.handshake_seen(&contact, &first).await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let storage = MemoryStorage::new();
        let mut entry = entry_for("bob", 60);
        entry.deposited = true;

        let first = storage.enqueue(entry.clone()).await.unwrap();
        let mut again = entry.clone();
        again.deposited = false;
        again.expires_at = entry.expires_at.plus(Duration::from_secs(600));
        let second = storage.enqueue(again).await.unwrap();

        assert_eq!(storage.len().await.unwrap(), 1);
        assert_eq!(second.expires_at, first.expires_at);
        assert!(second.deposited);
    }

    #[tokio::test]
    async fn test_dequeue_filters_contact_and_expiry() {
        let storage = MemoryStorage::new();
        let mut older = entry_for("bob", 60);
        older.enqueued_at = older.enqueued_at.minus(Duration::from_secs(5));
        let newer = entry_for("bob", 60);
        let mut stale = entry_for("bob", 60);
        stale.expires_at = Timestamp::now().minus(Duration::from_secs(1));

        for e in [newer.clone(), stale, older.clone(), entry_for("carol", 60)] {
            storage.enqueue(e).await.unwrap();
        }

        let ready = storage
            .dequeue_deliverable(&ContactId::from("bob"))
            .await
            .unwrap();
        let ids: Vec<_> = ready.iter().map(|e| e.message_id).collect();
        assert_eq!(ids, vec![older.message_id, newer.message_id]);

        // Reading does not consume
        assert_eq!(storage.len().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let storage = MemoryStorage::new();
        let keep = entry_for("bob", 60);
        storage.enqueue(keep.clone()).await.unwrap();
        storage.enqueue(entry_for("bob", 1)).await.unwrap();

        let later = Timestamp::now().plus(Duration::from_secs(2));
        assert_eq!(storage.purge_expired(later).await.unwrap(), 1);
        assert_eq!(storage.purge_expired(later).await.unwrap(), 0);
        assert!(storage.get(&keep.message_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_envelopes_by_status() {
        let storage = MemoryStorage::new();
        let mut queued = OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![]);
        queued.transition(DeliveryStatus::QueuedOffline).unwrap();
        let pending = OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![]);

        storage.save_envelope(&queued).await.unwrap();
        storage.save_envelope(&pending).await.unwrap();

        let found = storage
            .envelopes_with_status(&[DeliveryStatus::QueuedOffline])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].message_id, queued.message_id);

        storage.delete_envelope(&queued.message_id).await.unwrap();
        assert!(storage.load_envelope(&queued.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_finished_keeps_recent_and_outstanding() {
        let storage = MemoryStorage::new();
        let mut old = OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![]);
        old.transition(DeliveryStatus::QueuedOffline).unwrap();
        old.transition(DeliveryStatus::Delivered).unwrap();
        old.updated_at = Timestamp::now().minus(Duration::from_secs(3600));
        let mut recent = old.clone();
        recent.message_id = MessageId::new();
        recent.updated_at = Timestamp::now();
        let mut queued = OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![]);
        queued.transition(DeliveryStatus::QueuedOffline).unwrap();
        queued.updated_at = old.updated_at;

        for e in [&old, &recent, &queued] {
            storage.save_envelope(e).await.unwrap();
        }

        let cutoff = Timestamp::now().minus(Duration::from_secs(60));
        assert_eq!(storage.purge_finished(cutoff).await.unwrap(), 1);
        assert!(storage.load_envelope(&old.message_id).await.unwrap().is_none());
        assert!(storage.load_envelope(&recent.message_id).await.unwrap().is_some());
        assert!(storage.load_envelope(&queued.message_id).await.unwrap().is_some());
    }
}
