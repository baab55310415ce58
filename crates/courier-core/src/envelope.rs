//! Outbound envelopes and the delivery state machine

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::{ContactId, MessageId, Timestamp};

/// Delivery tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryPath {
    /// Peer-to-peer connection
    Direct,
    /// Server-relayed blind forwarding
    Relay,
    /// Durable queue until the recipient comes back
    StoreAndForward,
}

impl DeliveryPath {
    /// Next tier after a failure on this one
    pub fn fallback(self) -> Self {
        match self {
            DeliveryPath::Direct => DeliveryPath::Relay,
            DeliveryPath::Relay | DeliveryPath::StoreAndForward => DeliveryPath::StoreAndForward,
        }
    }

    /// Whether the tier needs the recipient online
    pub fn is_live(self) -> bool {
        !matches!(self, DeliveryPath::StoreAndForward)
    }
}

impl fmt::Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliveryPath::Direct => "direct",
            DeliveryPath::Relay => "relay",
            DeliveryPath::StoreAndForward => "store-and-forward",
        };
        f.write_str(name)
    }
}

/// Where an envelope is in its delivery lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// Sealed, not yet handed to a path
    Pending,
    /// Attempt on the direct path running
    InFlightDirect,
    /// Attempt on the relay path running
    InFlightRelay,
    /// Accepted by the recipient
    Delivered,
    /// Held in the offline queue
    QueuedOffline,
    /// Given up; see the envelope's failure reason
    Failed,
}

impl DeliveryStatus {
    /// Allowed edges of the delivery state machine
    ///
    /// Forward-only, with three exceptions: a queued envelope is re-attempted
    /// on wake, a failed one returns to Pending on manual retry, and
    /// re-queueing a queued envelope is a no-op.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;

        matches!(
            (self, next),
            (Pending, InFlightDirect | InFlightRelay | QueuedOffline | Failed)
                | (InFlightDirect, InFlightRelay | Delivered | QueuedOffline)
                | (InFlightRelay, Delivered | QueuedOffline)
                | (QueuedOffline, InFlightDirect | InFlightRelay | QueuedOffline | Delivered | Failed)
                | (Failed, Pending)
        )
    }

    /// The status of an attempt on `path`
    pub fn in_flight(path: DeliveryPath) -> Self {
        match path {
            DeliveryPath::Direct => DeliveryStatus::InFlightDirect,
            DeliveryPath::Relay => DeliveryStatus::InFlightRelay,
            DeliveryPath::StoreAndForward => DeliveryStatus::QueuedOffline,
        }
    }

    /// Whether an attempt was interrupted mid-flight
    pub fn is_in_flight(self) -> bool {
        matches!(self, DeliveryStatus::InFlightDirect | DeliveryStatus::InFlightRelay)
    }

    /// Whether delivery still has work to do
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Pending
                | DeliveryStatus::InFlightDirect
                | DeliveryStatus::InFlightRelay
                | DeliveryStatus::QueuedOffline
        )
    }
}

/// Why an envelope ended up Failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Cancelled before dispatch
    Cancelled,
    /// Offline retention ran out before delivery
    Expired,
}

/// A sealed outgoing message and its delivery bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Idempotency key
    pub message_id: MessageId,
    /// Recipient
    pub contact_id: ContactId,
    /// Encoded wire envelope, ready to transmit
    pub sealed_payload: Vec<u8>,
    /// Live-path attempts across the message's lifetime
    pub attempt_count: u32,
    /// Creation time
    pub created_at: Timestamp,
    /// Last status change
    pub updated_at: Timestamp,
    /// Path of the latest attempt
    pub current_path: Option<DeliveryPath>,
    /// Current status
    pub status: DeliveryStatus,
    /// Set while status is Failed
    pub failure: Option<FailureReason>,
}

impl OutboundEnvelope {
    /// New Pending envelope
    pub fn new(message_id: MessageId, contact_id: ContactId, sealed_payload: Vec<u8>) -> Self {
        let now = Timestamp::now();
        Self {
            message_id,
            contact_id,
            sealed_payload,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            current_path: None,
            status: DeliveryStatus::Pending,
            failure: None,
        }
    }

    /// Move to `next`, enforcing the state machine
    pub fn transition(&mut self, next: DeliveryStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                message_id: self.message_id.to_string(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next != DeliveryStatus::Failed {
            self.failure = None;
        }
        self.updated_at = Timestamp::now();
        Ok(())
    }

    /// Move to Failed with a reason
    pub fn fail(&mut self, reason: FailureReason) -> Result<()> {
        self.transition(DeliveryStatus::Failed)?;
        self.failure = Some(reason);
        Ok(())
    }

    /// Start a live attempt on `path`, counting it
    pub fn begin_attempt(&mut self, path: DeliveryPath) -> Result<()> {
        self.transition(DeliveryStatus::in_flight(path))?;
        self.current_path = Some(path);
        if path.is_live() {
            self.attempt_count += 1;
        }
        Ok(())
    }

    /// Put an envelope left InFlight by a crash back to Pending
    ///
    /// Returns whether anything changed.
    pub fn recover_interrupted(&mut self) -> bool {
        if self.status.is_in_flight() {
            self.status = DeliveryStatus::Pending;
            self.updated_at = Timestamp::now();
            true
        } else {
            false
        }
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

    fn envelope() -> OutboundEnvelope {
        OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![1, 2, 3])
    }

    #[test]
    fn test_fallback_chain_ends_at_store_and_forward() {
        assert_eq!(DeliveryPath::Direct.fallback(), DeliveryPath::Relay);
        assert_eq!(DeliveryPath::Relay.fallback(), DeliveryPath::StoreAndForward);
        assert_eq!(
            DeliveryPath::StoreAndForward.fallback(),
            DeliveryPath::StoreAndForward
        );
        assert!(!DeliveryPath::StoreAndForward.is_live());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut env = envelope();
        env.begin_attempt(DeliveryPath::Direct).unwrap();
        env.begin_attempt(DeliveryPath::Relay).unwrap();
        env.transition(DeliveryStatus::Delivered).unwrap();

        assert_eq!(env.attempt_count, 2);
        assert_eq!(env.current_path, Some(DeliveryPath::Relay));
        assert_eq!(env.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_delivered_is_final() {
        let mut env = envelope();
        env.begin_attempt(DeliveryPath::Direct).unwrap();
        env.transition(DeliveryStatus::Delivered).unwrap();

        for next in [
            DeliveryStatus::Pending,
            DeliveryStatus::QueuedOffline,
            DeliveryStatus::Failed,
        ] {
            assert!(matches!(
                env.transition(next),
                Err(Error::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_only_failed_goes_back_to_pending() {
        let mut env = envelope();
        env.transition(DeliveryStatus::QueuedOffline).unwrap();
        assert!(env.transition(DeliveryStatus::Pending).is_err());

        env.fail(FailureReason::Expired).unwrap();
        assert_eq!(env.failure, Some(FailureReason::Expired));

        env.transition(DeliveryStatus::Pending).unwrap();
        assert_eq!(env.failure, None);
    }

    #[test]
    fn test_store_and_forward_attempt_is_not_counted() {
        let mut env = envelope();
        env.begin_attempt(DeliveryPath::StoreAndForward).unwrap();
        assert_eq!(env.status, DeliveryStatus::QueuedOffline);
        assert_eq!(env.attempt_count, 0);
    }

    #[test]
    fn test_recover_interrupted() {
        let mut env = envelope();
        assert!(!env.recover_interrupted());

        env.begin_attempt(DeliveryPath::Relay).unwrap();
        assert!(env.recover_interrupted());
        assert_eq!(env.status, DeliveryStatus::Pending);
        assert_eq!(env.attempt_count, 1);
    }
}
