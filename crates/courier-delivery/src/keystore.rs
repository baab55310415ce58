//! Key material access
//!
//! The delivery core never stores long-term keys itself. A [`Keystore`]
//! hands out our identity, the prekey bundles of contacts and the secrets
//! behind our own published prekeys.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::{debug, info};
use x25519_dalek::StaticSecret;

use courier_core::ContactId;
use courier_crypto::identity::IdentityKeyPair;
use courier_crypto::keys::PreKeyBundle;
use courier_crypto::x3dh::PreKeyManager;

use crate::error::{DeliveryError, Result};

/// Capability-scoped access to key material
pub trait Keystore: Send + Sync {
    /// Our long-term identity
    fn load_identity_key(&self) -> Result<IdentityKeyPair>;

    /// A contact's prekey bundle, if one is cached or can be fetched
    fn load_prekey_bundle(&self, contact_id: &ContactId) -> Option<PreKeyBundle>;

    /// Secret of one of our signed prekeys
    fn signed_prekey(&self, id: u32) -> Option<StaticSecret>;

    /// Secret of one of our unused one-time prekeys
    fn one_time_prekey(&self, id: u32) -> Option<StaticSecret>;

    /// Retire a one-time prekey after a handshake used it
    fn consume_one_time_prekey(&self, id: u32) -> bool;
}

struct CachedBundle {
    bundle: PreKeyBundle,
    handed_out: bool,
}

/// Keystore kept in process memory
///
/// Peer bundles are cached as published. The one-time prekey of a cached
/// bundle is handed out once; later loads return the bundle without it, as
/// its owner will have retired that key.
pub struct LocalKeystore {
    prekeys: Mutex<PreKeyManager>,
    peer_bundles: RwLock<HashMap<ContactId, CachedBundle>>,
    pool_size: usize,
    refill_threshold: usize,
}

impl LocalKeystore {
    /// Keystore with a fresh identity
    pub fn generate(pool_size: usize, refill_threshold: usize) -> Self {
        Self::from_identity(IdentityKeyPair::generate(), pool_size, refill_threshold)
    }

    /// Keystore around an existing identity
    pub fn from_identity(identity: IdentityKeyPair, pool_size: usize, refill_threshold: usize) -> Self {
        Self {
            prekeys: Mutex::new(PreKeyManager::new(identity, pool_size)),
            peer_bundles: RwLock::new(HashMap::new()),
            pool_size,
            refill_threshold,
        }
    }

    /// Our contact id, derived from the identity key
    pub fn contact_id(&self) -> Result<ContactId> {
        let identity_key = self.prekeys.lock().identity().public_key_bytes();
        ContactId::from_identity_key(&identity_key).map_err(|e| DeliveryError::Keystore(e.to_string()))
    }

    /// Publish a bundle for someone who wants to message us
    ///
    /// Each bundle names a different one-time prekey; the pool is topped up
    /// when it runs low.
    pub fn issue_bundle(&self) -> PreKeyBundle {
        let mut prekeys = self.prekeys.lock();
        if prekeys.available_one_time_prekeys() < self.refill_threshold {
            let added = prekeys.replenish(self.pool_size);
            info!("Replenished {} one-time prekeys", added);
        }
        prekeys.issue_bundle()
    }

    /// Remember a contact's bundle; returns the contact it belongs to
    pub fn cache_prekey_bundle(&self, bundle: PreKeyBundle) -> Result<ContactId> {
        let contact_id = ContactId::from_identity_key(&bundle.identity_key)
            .map_err(|e| DeliveryError::Keystore(format!("unusable prekey bundle: {}", e)))?;
        self.peer_bundles.write().insert(
            contact_id.clone(),
            CachedBundle {
                bundle,
                handed_out: false,
            },
        );
        debug!(contact = %contact_id, "Cached prekey bundle");
        Ok(contact_id)
    }

    /// Rotate our signed prekey; the previous one stays usable
    pub fn rotate_signed_prekey(&self) {
        self.prekeys.lock().rotate_signed_prekey();
        info!("Rotated signed prekey");
    }

    /// One-time prekeys still unissued
    pub fn available_one_time_prekeys(&self) -> usize {
        self.prekeys.lock().available_one_time_prekeys()
    }
}

impl Keystore for LocalKeystore {
    fn load_identity_key(&self) -> Result<IdentityKeyPair> {
        Ok(self.prekeys.lock().identity().clone())
    }

    fn load_prekey_bundle(&self, contact_id: &ContactId) -> Option<PreKeyBundle> {
        let mut bundles = self.peer_bundles.write();
        let cached = bundles.get_mut(contact_id)?;
        let mut bundle = cached.bundle.clone();
        if cached.handed_out {
            bundle.one_time_prekey = None;
        }
        cached.handed_out = true;
        Some(bundle)
    }

    fn signed_prekey(&self, id: u32) -> Option<StaticSecret> {
        self.prekeys.lock().signed_prekey_secret(id)
    }

    fn one_time_prekey(&self, id: u32) -> Option<StaticSecret> {
        self.prekeys.lock().one_time_prekey_secret(id)
    }

    fn consume_one_time_prekey(&self, id: u32) -> bool {
        self.prekeys.lock().consume_one_time_prekey(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundles_carry_distinct_one_time_prekeys() {
        let keystore = LocalKeystore::generate(3, 1);
        let a = keystore.issue_bundle();
        let b = keystore.issue_bundle();

        let a_id = a.one_time_prekey.unwrap().id;
        let b_id = b.one_time_prekey.unwrap().id;
        assert_ne!(a_id, b_id);
        assert!(keystore.one_time_prekey(a_id).is_some());

        assert!(keystore.consume_one_time_prekey(a_id));
        assert!(keystore.one_time_prekey(a_id).is_none());
        assert!(!keystore.consume_one_time_prekey(a_id));
    }

    #[test]
    fn test_pool_replenishes_below_threshold() {
        let keystore = LocalKeystore::generate(4, 2);
        for _ in 0..3 {
            keystore.issue_bundle();
        }
        // 1 left < 2, so the next issue refills to 4 first
        keystore.issue_bundle();
        assert_eq!(keystore.available_one_time_prekeys(), 3);
    }

    #[test]
    fn test_cached_bundle_hands_out_one_time_prekey_once() {
        let alice = LocalKeystore::generate(0, 0);
        let bob = LocalKeystore::generate(2, 0);

        let bob_id = alice.cache_prekey_bundle(bob.issue_bundle()).unwrap();
        assert_eq!(bob_id, bob.contact_id().unwrap());

        assert!(alice.load_prekey_bundle(&bob_id).unwrap().one_time_prekey.is_some());
        assert!(alice.load_prekey_bundle(&bob_id).unwrap().one_time_prekey.is_none());
        assert!(alice.load_prekey_bundle(&ContactId::from("carol")).is_none());
    }
}
