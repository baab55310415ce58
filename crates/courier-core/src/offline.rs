//! Offline queue entries

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::types::{ContactId, MessageId, Timestamp};

/// A sealed message held until its recipient comes back
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineEntry {
    /// Message id, unique within the queue
    pub message_id: MessageId,
    /// Recipient
    pub contact_id: ContactId,
    /// Encoded wire envelope
    pub sealed_payload: Vec<u8>,
    /// When the message was first queued
    pub enqueued_at: Timestamp,
    /// After this instant the entry is purged instead of delivered
    pub expires_at: Timestamp,
    /// Whether a copy has been handed to the store-and-forward server
    pub deposited: bool,
}

impl OfflineEntry {
    /// Entry queued now, expiring after `ttl`
    pub fn new(
        message_id: MessageId,
        contact_id: ContactId,
        sealed_payload: Vec<u8>,
        ttl: Duration,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            message_id,
            contact_id,
            sealed_payload,
            enqueued_at: now,
            expires_at: now.plus(ttl),
            deposited: false,
        }
    }

    /// Whether the retention window has passed at `now`
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Whether the retention window has passed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }

    /// Merge a re-enqueue of the same message into the stored entry
    ///
    /// Keeps the original retention window; a deposit is never forgotten.
    pub fn merge(&mut self, newer: OfflineEntry) {
        self.sealed_payload = newer.sealed_payload;
        self.deposited |= newer.deposited;
    }

    /// Serialize for storage
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from storage
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let entry = OfflineEntry::new(
            MessageId::new(),
            ContactId::from("bob"),
            vec![7; 8],
            Duration::from_secs(60),
        );

        assert!(!entry.is_expired());
        assert!(!entry.is_expired_at(entry.enqueued_at));
        assert!(entry.is_expired_at(entry.expires_at));
        assert!(entry.is_expired_at(entry.enqueued_at.plus(Duration::from_secs(61))));
    }

    #[test]
    fn test_merge_keeps_window_and_deposit() {
        let mut stored = OfflineEntry::new(
            MessageId::new(),
            ContactId::from("bob"),
            vec![1],
            Duration::from_secs(60),
        );
        stored.deposited = true;
        let window = (stored.enqueued_at, stored.expires_at);

        let mut again = stored.clone();
        again.enqueued_at = stored.enqueued_at.plus(Duration::from_secs(30));
        again.expires_at = stored.expires_at.plus(Duration::from_secs(30));
        again.deposited = false;
        stored.merge(again);

        assert_eq!((stored.enqueued_at, stored.expires_at), window);
        assert!(stored.deposited);
    }
}
