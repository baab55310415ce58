//! Peer reachability snapshots

use serde::{Deserialize, Serialize};

use crate::types::{ContactId, Timestamp};

/// What the network layer currently knows about a peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReachability {
    /// The peer
    pub contact_id: ContactId,
    /// Whether the peer is connected to the relay or reachable at all
    pub is_online: bool,
    /// Whether a direct connection can be attempted
    pub supports_direct: bool,
    /// Last time the peer was observed online
    pub last_seen_at: Option<Timestamp>,
}

impl PeerReachability {
    /// A peer that is not reachable
    pub fn offline(contact_id: ContactId) -> Self {
        Self {
            contact_id,
            is_online: false,
            supports_direct: false,
            last_seen_at: None,
        }
    }

    /// A peer seen online just now
    pub fn online(contact_id: ContactId, supports_direct: bool) -> Self {
        Self {
            contact_id,
            is_online: true,
            supports_direct,
            last_seen_at: Some(Timestamp::now()),
        }
    }
}
