//! Key derivation for the handshake and the ratchet
//!
//! HKDF-SHA512 with domain separation for root keys, and the HMAC-SHA256
//! symmetric chain step used by both ratchet directions.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, Result};

/// HKDF using SHA-512 for key derivation
pub type HkdfSha512 = Hkdf<Sha512>;

/// HMAC-SHA256 for chain derivation
pub type HmacSha256 = Hmac<Sha256>;

/// Domain separation strings for different key derivation contexts
pub mod domain {
    /// Root key derivation from X3DH and DH ratchet steps
    pub const ROOT_KEY: &[u8] = b"Courier_v1_RootKey";
    /// Chain key derivation from DH ratchet steps
    pub const CHAIN_KEY: &[u8] = b"Courier_v1_ChainKey";
}

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// A derived key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey<const N: usize>([u8; N]);

impl<const N: usize> DerivedKey<N> {
    /// Get key bytes
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }

    /// Copy out the raw bytes
    pub fn to_bytes(&self) -> [u8; N] {
        self.0
    }
}

/// HKDF extract-then-expand context
pub struct KeyDerivationContext {
    hkdf: HkdfSha512,
}

impl KeyDerivationContext {
    /// Create a new KDF context from input key material
    ///
    /// `salt` of `None` means a zero-filled salt.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        Self {
            hkdf: HkdfSha512::new(salt, ikm),
        }
    }

    /// Derive a key with the given info string
    pub fn derive<const N: usize>(&self, info: &[u8]) -> Result<DerivedKey<N>> {
        let mut output = [0u8; N];
        self.hkdf
            .expand(info, &mut output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;
        Ok(DerivedKey(output))
    }
}

/// Symmetric-key ratchet over a single chain
pub struct ChainRatchet {
    chain_key: [u8; 32],
}

impl ChainRatchet {
    /// Create a new chain ratchet from an initial chain key
    pub fn new(chain_key: [u8; 32]) -> Self {
        Self { chain_key }
    }

    /// Step the chain once
    ///
    /// Returns `(next_chain_key, message_key)`; the previous chain key is
    /// overwritten.
    pub fn ratchet(&mut self) -> ([u8; 32], [u8; 32]) {
        let message_key = self.hmac_derive(MESSAGE_KEY_SEED);
        let next_chain_key = self.hmac_derive(CHAIN_KEY_SEED);

        self.chain_key = next_chain_key;
        (next_chain_key, message_key)
    }

    /// Get current chain key
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    fn hmac_derive(&self, seed: u8) -> [u8; 32] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.chain_key)
            .expect("HMAC can take key of any size");
        mac.update(&[seed]);
        let mut output = [0u8; 32];
        output.copy_from_slice(&mac.finalize().into_bytes());
        output
    }
}

impl Drop for ChainRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// Root KDF: mix a DH output into the root key
///
/// Returns `(new_root_key, chain_key)`.
pub fn derive_root_and_chain_keys(
    root_key: &[u8; 32],
    dh_output: &[u8; 32],
) -> Result<([u8; 32], [u8; 32])> {
    let kdf = KeyDerivationContext::new(Some(root_key), dh_output);

    let new_root_key: DerivedKey<32> = kdf.derive(domain::ROOT_KEY)?;
    let chain_key: DerivedKey<32> = kdf.derive(domain::CHAIN_KEY)?;

    Ok((new_root_key.to_bytes(), chain_key.to_bytes()))
}

/// Chain KDF: returns `(next_chain_key, message_key)`
pub fn derive_message_keys(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    ChainRatchet::new(*chain_key).ratchet()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_context() {
        let ikm = [0x42u8; 32];
        let kdf = KeyDerivationContext::new(Some(b"test-salt"), &ikm);

        let key1: DerivedKey<32> = kdf.derive(b"context1").unwrap();
        let key2: DerivedKey<32> = kdf.derive(b"context2").unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());

        let key1_again: DerivedKey<32> = kdf.derive(b"context1").unwrap();
        assert_eq!(key1.as_bytes(), key1_again.as_bytes());
    }

    #[test]
    fn test_chain_ratchet_never_repeats() {
        let mut ratchet = ChainRatchet::new([0x42u8; 32]);

        let (chain1, msg1) = ratchet.ratchet();
        let (chain2, msg2) = ratchet.ratchet();

        assert_ne!(chain1, chain2);
        assert_ne!(msg1, msg2);
        assert_ne!(chain1, msg1);
        assert_eq!(ratchet.chain_key(), &chain2);
    }

    #[test]
    fn test_derive_message_keys_matches_ratchet() {
        let chain_key = [0x07u8; 32];
        let mut ratchet = ChainRatchet::new(chain_key);
        assert_eq!(derive_message_keys(&chain_key), ratchet.ratchet());
    }

    #[test]
    fn test_root_kdf_depends_on_both_inputs() {
        let (root_a, chain_a) = derive_root_and_chain_keys(&[1; 32], &[2; 32]).unwrap();
        let (root_b, chain_b) = derive_root_and_chain_keys(&[1; 32], &[3; 32]).unwrap();
        let (root_c, _) = derive_root_and_chain_keys(&[4; 32], &[2; 32]).unwrap();

        assert_ne!(root_a, root_b);
        assert_ne!(chain_a, chain_b);
        assert_ne!(root_a, root_c);
        assert_ne!(root_a, chain_a);
    }
}
