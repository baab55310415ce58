//! # Courier Delivery
//!
//! The delivery core of a peer-to-peer messenger: for every outgoing message
//! it decides how to get an encrypted payload to the recipient, and it keeps
//! the Double Ratchet session state that makes the payload unreadable to
//! anyone else.
//!
//! ## Overview
//!
//! - **Ratchet Engine**: X3DH handshakes and per-message seal/unseal
//! - **Path Selection**: Direct, Relay or Store-and-Forward from reachability
//! - **Delivery Executor**: bounded-timeout attempts with tier fallback
//! - **Message Coordinator**: the public entry point, with ordered
//!   per-contact pipelines and delivery events
//!
//! ## Usage
//!
//! ```ignore
//! use courier_delivery::prelude::*;
//!
//! let coordinator = MessageCoordinator::builder()
//!     .config(DeliveryConfig::default())
//!     .keystore(keystore)
//!     .network(network)
//!     .build()
//!     .await?;
//!
//! let message_id = coordinator.send_text(&bob, "hi").await?;
//! let mut ticks = coordinator.on_status_changed(message_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod keystore;
pub mod logging;
pub mod selector;
pub mod transport;
pub mod wire;

pub use config::DeliveryConfig;
pub use coordinator::{CoordinatorBuilder, IncomingOutcome, MessageCoordinator};
pub use engine::{RatchetEngine, SessionChange, Unsealed};
pub use error::{DeliveryError, Result};
pub use events::{DeliveryEvent, EventBus};
pub use executor::{DeliveryExecutor, DeliveryOutcome};
pub use keystore::{Keystore, LocalKeystore};
pub use selector::select_path;
pub use transport::{PeerNetwork, TransportError};
pub use wire::{SealedPayload, WireEnvelope};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::DeliveryConfig;
    pub use crate::coordinator::{IncomingOutcome, MessageCoordinator};
    pub use crate::error::{DeliveryError, Result};
    pub use crate::events::DeliveryEvent;
    pub use crate::keystore::{Keystore, LocalKeystore};
    pub use crate::transport::memory::MemoryNetwork;
    pub use crate::transport::{PeerNetwork, TransportError};
    pub use courier_core::prelude::*;
}
