//! # Courier Core
//!
//! Plain data model and persistence for the courier delivery core.
//!
//! This crate provides:
//! - Identifiers and timestamps ([`ContactId`], [`MessageId`], [`Timestamp`])
//! - Session records wrapping persisted ratchet state
//! - Outbound envelopes and their delivery state machine
//! - Offline queue entries with TTL
//! - Storage traits with in-memory and sled-backed implementations

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod envelope;
pub mod error;
pub mod offline;
pub mod reachability;
pub mod session;
pub mod sled_store;
pub mod storage;
pub mod types;

pub use envelope::{DeliveryPath, DeliveryStatus, FailureReason, OutboundEnvelope};
pub use error::{Error, Result};
pub use offline::OfflineEntry;
pub use reachability::PeerReachability;
pub use session::{HandshakeState, SessionHandle, SessionRecord};
pub use sled_store::SledStorage;
pub use types::{ContactId, MessageId, Timestamp};

/// Default offline retention (14 days)
pub const DEFAULT_OFFLINE_TTL_SECS: u64 = 14 * 24 * 3600;

/// Accepted handshakes remembered per contact
pub const MAX_ACCEPTED_HANDSHAKES: usize = 64;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::envelope::{DeliveryPath, DeliveryStatus, OutboundEnvelope};
    pub use crate::error::{Error, Result};
    pub use crate::offline::OfflineEntry;
    pub use crate::reachability::PeerReachability;
    pub use crate::session::SessionRecord;
    pub use crate::storage::{EnvelopeStore, OfflineStore, SessionStore};
    pub use crate::types::{ContactId, MessageId, Timestamp};
}
