//! Delivery events for the application layer
//!
//! Every subscriber gets its own unbounded channel, so a slow UI never
//! blocks delivery and never loses an event. Events are emitted under one
//! lock, which keeps their order identical across subscribers.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use courier_core::{ContactId, DeliveryPath, DeliveryStatus, MessageId, OutboundEnvelope, Timestamp};

/// Something the application may want to show
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// An outgoing message changed status
    StatusChanged {
        /// The message
        message_id: MessageId,
        /// Its recipient
        contact_id: ContactId,
        /// New status
        status: DeliveryStatus,
        /// Path of the latest attempt
        path: Option<DeliveryPath>,
    },
    /// A message was decrypted
    MessageReceived {
        /// Sender-assigned id
        message_id: MessageId,
        /// The sender
        contact_id: ContactId,
        /// Plaintext
        body: Vec<u8>,
        /// When it was opened here
        received_at: Timestamp,
    },
    /// A message failed authentication and was dropped
    Undecryptable {
        /// Sender-assigned id
        message_id: MessageId,
        /// Claimed sender
        contact_id: ContactId,
        /// Why
        reason: String,
    },
    /// The session with a contact no longer lines up; a fresh handshake is needed
    SessionDesync {
        /// The contact
        contact_id: ContactId,
        /// Why
        reason: String,
    },
    /// A contact's handshake was refused
    HandshakeFailed {
        /// The contact
        contact_id: ContactId,
        /// Why
        reason: String,
    },
    /// The session with a contact was replaced or deleted
    SessionReset {
        /// The contact
        contact_id: ContactId,
    },
}

impl DeliveryEvent {
    pub(crate) fn status_of(envelope: &OutboundEnvelope) -> Self {
        DeliveryEvent::StatusChanged {
            message_id: envelope.message_id,
            contact_id: envelope.contact_id.clone(),
            status: envelope.status,
            path: envelope.current_path,
        }
    }

    /// The message this event is about, if any
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            DeliveryEvent::StatusChanged { message_id, .. }
            | DeliveryEvent::MessageReceived { message_id, .. }
            | DeliveryEvent::Undecryptable { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// Fan-out of delivery events
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<DeliveryEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> UnboundedReceiverStream<DeliveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Deliver to every live subscriber, dropping those that went away
    pub fn emit(&self, event: DeliveryEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Live subscribers
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribers_see_same_order() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let alice = ContactId::from("alice");

        bus.emit(DeliveryEvent::SessionReset { contact_id: alice.clone() });
        bus.emit(DeliveryEvent::SessionDesync {
            contact_id: alice.clone(),
            reason: "gap".into(),
        });

        for stream in [&mut first, &mut second] {
            assert!(matches!(stream.next().await, Some(DeliveryEvent::SessionReset { .. })));
            assert!(matches!(stream.next().await, Some(DeliveryEvent::SessionDesync { .. })));
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(DeliveryEvent::SessionReset {
            contact_id: ContactId::from("bob"),
        });
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_status_event_carries_message_id() {
        let envelope = OutboundEnvelope::new(MessageId::new(), ContactId::from("bob"), vec![]);
        let event = DeliveryEvent::status_of(&envelope);
        assert_eq!(event.message_id(), Some(envelope.message_id));
        assert!(DeliveryEvent::SessionReset {
            contact_id: ContactId::from("bob")
        }
        .message_id()
        .is_none());
    }
}
