//! Delivery executor
//!
//! Drives one envelope through the tiers. Each send tries every tier at most
//! once, Direct then Relay then Store-and-Forward, starting wherever the
//! selector points. Live attempts run under a timeout and count toward a
//! per-message cap; once the cap is spent the envelope goes straight to the
//! offline queue. The offline tier cannot fail: a durable local enqueue is
//! the success condition, and handing a copy to the server is best-effort.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use courier_core::storage::{EnvelopeStore, OfflineStore};
use courier_core::{DeliveryPath, DeliveryStatus, MessageId, OfflineEntry, OutboundEnvelope};

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::events::{DeliveryEvent, EventBus};
use crate::selector::{escalation, select_path};
use crate::transport::{PeerNetwork, TransportError};

/// Where one send left an envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// The message
    pub message_id: MessageId,
    /// Final status of this send
    pub status: DeliveryStatus,
    /// Tier that finished the send
    pub path: DeliveryPath,
    /// Live attempts made during this send
    pub live_attempts: u32,
}

/// Applies an envelope change, persists it and reports a status change
pub(crate) struct Transitions {
    envelopes: Arc<dyn EnvelopeStore>,
    events: EventBus,
}

impl Transitions {
    pub(crate) fn new(envelopes: Arc<dyn EnvelopeStore>, events: EventBus) -> Self {
        Self { envelopes, events }
    }

    pub(crate) async fn apply(
        &self,
        envelope: &mut OutboundEnvelope,
        change: impl FnOnce(&mut OutboundEnvelope) -> courier_core::Result<()>,
    ) -> Result<()> {
        let before = envelope.status;
        change(envelope)?;
        self.envelopes.save_envelope(envelope).await?;
        if envelope.status != before {
            self.events.emit(DeliveryEvent::status_of(envelope));
        }
        Ok(())
    }
}

/// Attempts delivery with fallback
pub struct DeliveryExecutor {
    network: Arc<dyn PeerNetwork>,
    offline: Arc<dyn OfflineStore>,
    transitions: Transitions,
    config: DeliveryConfig,
}

impl DeliveryExecutor {
    /// Create an executor
    pub fn new(
        config: DeliveryConfig,
        network: Arc<dyn PeerNetwork>,
        envelopes: Arc<dyn EnvelopeStore>,
        offline: Arc<dyn OfflineStore>,
        events: EventBus,
    ) -> Self {
        Self {
            network,
            offline,
            transitions: Transitions::new(envelopes, events),
            config,
        }
    }

    /// Deliver an envelope, falling back until it is Delivered or QueuedOffline
    ///
    /// A Delivered envelope is left alone. Every status change is persisted
    /// before the next step and emitted as an event.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id, contact = %envelope.contact_id))]
    pub async fn send(&self, envelope: &mut OutboundEnvelope) -> Result<DeliveryOutcome> {
        if envelope.status == DeliveryStatus::Delivered {
            return Ok(self.outcome(envelope, 0));
        }

        let reachability = self.network.reachability(&envelope.contact_id);
        let first = select_path(&envelope.contact_id, &reachability);
        let bytes = Bytes::from(envelope.sealed_payload.clone());
        let mut live_attempts = 0;

        for path in escalation(first) {
            if !path.is_live() {
                break;
            }
            if envelope.attempt_count >= self.config.max_live_attempts {
                debug!(attempts = envelope.attempt_count, "Live attempt cap reached");
                break;
            }

            self.transitions
                .apply(envelope, |e| e.begin_attempt(path))
                .await?;
            live_attempts += 1;

            match self.attempt(path, envelope, bytes.clone()).await {
                Ok(()) => {
                    self.transitions
                        .apply(envelope, |e| e.transition(DeliveryStatus::Delivered))
                        .await?;
                    if self.offline.remove(&envelope.message_id).await? {
                        debug!("Removed offline copy");
                    }
                    info!(%path, "Delivered");
                    return Ok(self.outcome(envelope, live_attempts));
                }
                Err(e) => warn!(%path, "Attempt failed, falling back: {}", e),
            }
        }

        self.store_and_forward(envelope).await?;
        Ok(self.outcome(envelope, live_attempts))
    }

    async fn attempt(
        &self,
        path: DeliveryPath,
        envelope: &OutboundEnvelope,
        bytes: Bytes,
    ) -> std::result::Result<(), TransportError> {
        let budget = self.config.timeout_for(path);
        match tokio::time::timeout(budget, self.network.transmit(path, &envelope.contact_id, bytes)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                path,
                after_ms: budget.as_millis() as u64,
            }),
        }
    }

    async fn store_and_forward(&self, envelope: &mut OutboundEnvelope) -> Result<()> {
        let entry = OfflineEntry::new(
            envelope.message_id,
            envelope.contact_id.clone(),
            envelope.sealed_payload.clone(),
            self.config.offline_ttl(),
        );
        let mut stored = self.offline.enqueue(entry).await?;

        self.transitions
            .apply(envelope, |e| e.begin_attempt(DeliveryPath::StoreAndForward))
            .await?;
        info!(expires_at = %stored.expires_at, "Queued offline");

        if !stored.deposited {
            let bytes = Bytes::from(stored.sealed_payload.clone());
            match self.attempt(DeliveryPath::StoreAndForward, envelope, bytes).await {
                Ok(()) => {
                    stored.deposited = true;
                    self.offline.enqueue(stored).await?;
                    debug!("Deposited with store-and-forward server");
                }
                Err(e) => warn!("Deposit failed, will retry on next wake: {}", e),
            }
        }
        Ok(())
    }

    fn outcome(&self, envelope: &OutboundEnvelope, live_attempts: u32) -> DeliveryOutcome {
        DeliveryOutcome {
            message_id: envelope.message_id,
            status: envelope.status,
            path: envelope.current_path.unwrap_or(DeliveryPath::StoreAndForward),
            live_attempts,
        }
    }
}
