//! # Courier Cryptographic Library
//!
//! Cryptographic building blocks for the courier delivery core. Nothing in
//! this crate performs I/O; session persistence and locking live in
//! `courier-core` and `courier-delivery`.
//!
//! ## Core Components
//!
//! - [`identity`]: Long-term identity keys and fingerprints
//! - [`x3dh`]: Prekey management and the X3DH handshake
//! - [`ratchet`]: Double Ratchet with a bounded skip window
//! - [`keys`]: Ephemeral keys, prekey bundles and public key wrappers
//! - [`aead`]: Authenticated encryption (XChaCha20-Poly1305, AES-256-GCM)
//! - [`kdf`]: HKDF and HMAC chain derivation

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use error::{CryptoError, Result};

/// Protocol version carried in every wire envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum plaintext size in bytes (64 KB)
pub const MAX_MESSAGE_SIZE: usize = 65536;

/// Default bound on skipped message keys held per session
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::aead::{Aead, AeadKey, Nonce};
    pub use crate::error::{CryptoError, Result};
    pub use crate::identity::{IdentityKeyPair, IdentityPublicKey};
    pub use crate::keys::{EphemeralKeyPair, PreKeyBundle, PublicKeyBytes, SignedPreKey};
    pub use crate::ratchet::{RatchetHeader, RatchetMessage, RatchetState};
    pub use crate::x3dh::{PreKeyManager, X3DHHeader, X3DHKeyAgreement, X3DHSharedSecret};
}
