//! Shared fixtures for delivery integration tests

#![allow(dead_code)]

use futures::{FutureExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;

use courier_delivery::prelude::*;

/// One side of a conversation
pub struct Party {
    pub keystore: Arc<LocalKeystore>,
    pub coordinator: MessageCoordinator,
}

impl Party {
    pub fn id(&self) -> &ContactId {
        self.coordinator.own_id()
    }
}

/// Two keystores that already hold each other's prekey bundle
pub fn introduced_keystores() -> (Arc<LocalKeystore>, Arc<LocalKeystore>) {
    let alice = Arc::new(LocalKeystore::generate(10, 2));
    let bob = Arc::new(LocalKeystore::generate(10, 2));
    alice.cache_prekey_bundle(bob.issue_bundle()).unwrap();
    bob.cache_prekey_bundle(alice.issue_bundle()).unwrap();
    (alice, bob)
}

pub async fn build(
    keystore: Arc<LocalKeystore>,
    network: &MemoryNetwork,
    config: DeliveryConfig,
) -> MessageCoordinator {
    MessageCoordinator::builder()
        .config(config)
        .keystore(keystore)
        .network(Arc::new(network.clone()))
        .build()
        .await
        .unwrap()
}

/// Alice and Bob on one in-memory network, both offline
pub async fn alice_and_bob(network: &MemoryNetwork) -> (Party, Party) {
    let (alice_keys, bob_keys) = introduced_keystores();
    let alice = Party {
        coordinator: build(alice_keys.clone(), network, DeliveryConfig::default()).await,
        keystore: alice_keys,
    };
    let bob = Party {
        coordinator: build(bob_keys.clone(), network, DeliveryConfig::default()).await,
        keystore: bob_keys,
    };
    (alice, bob)
}

/// Status changes of one message, until nothing happens for a while
pub async fn statuses_of(
    events: &mut UnboundedReceiverStream<DeliveryEvent>,
    message_id: MessageId,
) -> Vec<DeliveryStatus> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), events.next()).await {
        if let DeliveryEvent::StatusChanged {
            message_id: id,
            status,
            ..
        } = event
        {
            if id == message_id {
                seen.push(status);
            }
        }
    }
    seen
}

/// Wait until the message stops changing and return where it ended up
pub async fn settled_status(coordinator: &MessageCoordinator, message_id: MessageId) -> DeliveryStatus {
    let mut updates = coordinator.on_status_changed(message_id).await.unwrap();
    let mut last = None;
    while let Ok(Some(status)) = tokio::time::timeout(Duration::from_millis(300), updates.next()).await {
        last = Some(status);
    }
    last.unwrap()
}

/// Bodies of every MessageReceived event seen so far
pub fn received_bodies(events: &mut UnboundedReceiverStream<DeliveryEvent>) -> Vec<Vec<u8>> {
    let mut bodies = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        if let DeliveryEvent::MessageReceived { body, .. } = event {
            bodies.push(body);
        }
    }
    bodies
}

/// Fresh directory under the system temp dir
pub fn temp_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("courier-{}-{}", label, MessageId::new()))
}
