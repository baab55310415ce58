//! Networking seam
//!
//! The delivery core does not own sockets. It asks a [`PeerNetwork`] for a
//! contact's reachability, hands it sealed bytes for one path at a time and
//! pulls whatever a store-and-forward server holds for us.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use courier_core::{ContactId, DeliveryPath, PeerReachability};

/// Failure of a single transmit; always recoverable by falling back a tier
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Peer cannot be reached on this path
    #[error("Peer {0} unreachable")]
    Unreachable(String),

    /// Attempt ran past its budget
    #[error("{path} attempt timed out after {after_ms}ms")]
    Timeout {
        /// The path attempted
        path: DeliveryPath,
        /// Budget that ran out
        after_ms: u64,
    },

    /// Remote side refused the payload
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Any other network failure
    #[error("Network error: {0}")]
    Network(String),
}

/// Reachability oracle and send/pull primitives of the networking layer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerNetwork: Send + Sync {
    /// Current view of a contact; never mutated by the core
    fn reachability(&self, contact_id: &ContactId) -> PeerReachability;

    /// Send sealed bytes over one path
    async fn transmit(
        &self,
        path: DeliveryPath,
        contact_id: &ContactId,
        bytes: Bytes,
    ) -> Result<(), TransportError>;

    /// Pull everything a server stored for `own_id`
    async fn fetch_stored(&self, own_id: &ContactId) -> Result<Vec<Bytes>, TransportError>;
}

/// In-process network for tests and simulations
pub mod memory {
    use super::*;
    use courier_core::Timestamp;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::debug;

    #[derive(Default)]
    struct Peer {
        online: bool,
        supports_direct: bool,
        last_seen_at: Option<Timestamp>,
        inbox: Vec<Bytes>,
        mailbox: Vec<Bytes>,
    }

    #[derive(Default)]
    struct Hub {
        peers: HashMap<ContactId, Peer>,
        failing: HashSet<DeliveryPath>,
        latency: HashMap<DeliveryPath, Duration>,
        log: Vec<(DeliveryPath, ContactId)>,
    }

    /// Shared hub: every party on it sees the same peers and mailboxes
    ///
    /// Live transmits land in the recipient's inbox; store-and-forward
    /// deposits land in its mailbox and are drained by `fetch_stored`.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        hub: Arc<Mutex<Hub>>,
    }

    impl MemoryNetwork {
        /// Create an empty network
        pub fn new() -> Self {
            Self::default()
        }

        /// Bring a peer online
        pub fn set_online(&self, contact_id: &ContactId, supports_direct: bool) -> PeerReachability {
            let mut hub = self.hub.lock();
            let peer = hub.peers.entry(contact_id.clone()).or_default();
            peer.online = true;
            peer.supports_direct = supports_direct;
            peer.last_seen_at = Some(Timestamp::now());
            Self::view(contact_id, peer)
        }

        /// Take a peer offline
        pub fn set_offline(&self, contact_id: &ContactId) -> PeerReachability {
            let mut hub = self.hub.lock();
            let peer = hub.peers.entry(contact_id.clone()).or_default();
            peer.online = false;
            peer.supports_direct = false;
            Self::view(contact_id, peer)
        }

        /// Make every transmit on `path` fail
        pub fn fail_path(&self, path: DeliveryPath) {
            self.hub.lock().failing.insert(path);
        }

        /// Undo [`MemoryNetwork::fail_path`]
        pub fn heal_path(&self, path: DeliveryPath) {
            self.hub.lock().failing.remove(&path);
        }

        /// Delay every transmit on `path`
        pub fn set_latency(&self, path: DeliveryPath, latency: Duration) {
            self.hub.lock().latency.insert(path, latency);
        }

        /// Take the bytes delivered live to `contact_id`
        pub fn drain_inbox(&self, contact_id: &ContactId) -> Vec<Bytes> {
            self.hub
                .lock()
                .peers
                .get_mut(contact_id)
                .map(|p| std::mem::take(&mut p.inbox))
                .unwrap_or_default()
        }

        /// Deposits waiting for `contact_id`
        pub fn stored_count(&self, contact_id: &ContactId) -> usize {
            self.hub
                .lock()
                .peers
                .get(contact_id)
                .map(|p| p.mailbox.len())
                .unwrap_or(0)
        }

        /// Every successful transmit so far, in order
        pub fn transmissions(&self) -> Vec<(DeliveryPath, ContactId)> {
            self.hub.lock().log.clone()
        }

        fn view(contact_id: &ContactId, peer: &Peer) -> PeerReachability {
            PeerReachability {
                contact_id: contact_id.clone(),
                is_online: peer.online,
                supports_direct: peer.online && peer.supports_direct,
                last_seen_at: peer.last_seen_at,
            }
        }
    }

    #[async_trait]
    impl PeerNetwork for MemoryNetwork {
        fn reachability(&self, contact_id: &ContactId) -> PeerReachability {
            let hub = self.hub.lock();
            match hub.peers.get(contact_id) {
                Some(peer) => Self::view(contact_id, peer),
                None => PeerReachability::offline(contact_id.clone()),
            }
        }

        async fn transmit(
            &self,
            path: DeliveryPath,
            contact_id: &ContactId,
            bytes: Bytes,
        ) -> Result<(), TransportError> {
            let latency = self.hub.lock().latency.get(&path).copied();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }

            let mut hub = self.hub.lock();
            if hub.failing.contains(&path) {
                return Err(TransportError::Network(format!("{} path down", path)));
            }

            let peer = hub.peers.entry(contact_id.clone()).or_default();
            match path {
                DeliveryPath::Direct if peer.online && peer.supports_direct => {
                    peer.inbox.push(bytes)
                }
                DeliveryPath::Relay if peer.online => peer.inbox.push(bytes),
                DeliveryPath::StoreAndForward => peer.mailbox.push(bytes),
                _ => return Err(TransportError::Unreachable(contact_id.to_string())),
            }
            hub.log.push((path, contact_id.clone()));

            debug!(%path, contact = %contact_id, "Transmitted");
            Ok(())
        }

        async fn fetch_stored(&self, own_id: &ContactId) -> Result<Vec<Bytes>, TransportError> {
            Ok(self
                .hub
                .lock()
                .peers
                .get_mut(own_id)
                .map(|p| std::mem::take(&mut p.mailbox))
                .unwrap_or_default())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_live_paths_follow_reachability() {
            let network = MemoryNetwork::new();
            let bob = ContactId::from("bob");
            let payload = Bytes::from_static(b"sealed");

            assert!(matches!(
                network
                    .transmit(DeliveryPath::Relay, &bob, payload.clone())
                    .await,
                Err(TransportError::Unreachable(_))
            ));

            network.set_online(&bob, false);
            assert!(network
                .transmit(DeliveryPath::Direct, &bob, payload.clone())
                .await
                .is_err());
            network
                .transmit(DeliveryPath::Relay, &bob, payload.clone())
                .await
                .unwrap();

            assert_eq!(network.drain_inbox(&bob), vec![payload]);
            assert!(network.drain_inbox(&bob).is_empty());
        }

        #[tokio::test]
        async fn test_mailbox_drains_on_fetch() {
            let network = MemoryNetwork::new();
            let bob = ContactId::from("bob");

            network
                .transmit(DeliveryPath::StoreAndForward, &bob, Bytes::from_static(b"a"))
                .await
                .unwrap();
            assert_eq!(network.stored_count(&bob), 1);
            assert!(!network.reachability(&bob).is_online);

            assert_eq!(network.fetch_stored(&bob).await.unwrap().len(), 1);
            assert!(network.fetch_stored(&bob).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_injected_failure() {
            let network = MemoryNetwork::new();
            let bob = ContactId::from("bob");
            network.set_online(&bob, true);
            network.fail_path(DeliveryPath::Direct);

            assert!(matches!(
                network
                    .transmit(DeliveryPath::Direct, &bob, Bytes::new())
                    .await,
                Err(TransportError::Network(_))
            ));

            network.heal_path(DeliveryPath::Direct);
            network
                .transmit(DeliveryPath::Direct, &bob, Bytes::new())
                .await
                .unwrap();
            assert_eq!(network.transmissions(), vec![(DeliveryPath::Direct, bob)]);
        }
    }
}
