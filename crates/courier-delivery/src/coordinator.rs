//! Message coordinator - main entry point for the application layer
//!
//! Outgoing messages are sealed as soon as they are submitted, persisted as
//! Pending envelopes and handed to a per-contact pipeline. One task drains
//! each pipeline in order, so a contact receives messages in the order they
//! were sent while different contacts never wait on each other.
//!
//! Everything crossing this boundary is plain data: ids, byte buffers and
//! enumerated statuses.

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use courier_core::session::SessionHandle;
use courier_core::storage::memory::MemoryStorage;
use courier_core::storage::{EnvelopeStore, OfflineStore, SessionStore};
use courier_core::{
    ContactId, DeliveryStatus, FailureReason, MessageId, OutboundEnvelope, PeerReachability,
    SledStorage, Timestamp,
};

use crate::config::DeliveryConfig;
use crate::engine::{RatchetEngine, SessionChange};
use crate::error::{DeliveryError, Result};
use crate::events::{DeliveryEvent, EventBus};
use crate::executor::{DeliveryExecutor, Transitions};
use crate::keystore::Keystore;
use crate::transport::PeerNetwork;
use crate::wire::WireEnvelope;

const QUEUED: u8 = 0;
const DISPATCHED: u8 = 1;
const CANCELLED: u8 = 2;

/// What happened to one received payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IncomingOutcome {
    /// Decrypted and announced
    Received {
        /// Sender-assigned id
        message_id: MessageId,
        /// The sender
        contact_id: ContactId,
    },
    /// Already received over another path; dropped silently
    Duplicate(MessageId),
    /// Failed authentication
    Undecryptable(MessageId),
    /// Outside the skip window or no session to decrypt with
    Desynced(MessageId),
    /// Handshake refused
    HandshakeRejected(MessageId),
}

struct Job {
    message_id: MessageId,
    ticket: Arc<AtomicU8>,
}

/// Bounded memory of received messages, per sender
///
/// Ids are chosen by senders, so one contact reusing another's id must not
/// shadow the other's message.
struct SeenCache {
    order: VecDeque<(ContactId, MessageId)>,
    ids: HashSet<(ContactId, MessageId)>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, sender: &ContactId, id: MessageId) -> bool {
        self.ids.contains(&(sender.clone(), id))
    }

    fn insert(&mut self, sender: &ContactId, id: MessageId) -> bool {
        let key = (sender.clone(), id);
        if !self.ids.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

struct Stores {
    sessions: Arc<dyn SessionStore>,
    envelopes: Arc<dyn EnvelopeStore>,
    offline: Arc<dyn OfflineStore>,
}

impl Stores {
    fn of<S>(storage: Arc<S>) -> Self
    where
        S: SessionStore + EnvelopeStore + OfflineStore + 'static,
    {
        Self {
            sessions: storage.clone(),
            envelopes: storage.clone(),
            offline: storage,
        }
    }
}

struct Inner {
    config: DeliveryConfig,
    engine: RatchetEngine,
    executor: DeliveryExecutor,
    transitions: Transitions,
    network: Arc<dyn PeerNetwork>,
    envelopes: Arc<dyn EnvelopeStore>,
    offline: Arc<dyn OfflineStore>,
    events: EventBus,
    pipelines: DashMap<ContactId, mpsc::UnboundedSender<Job>>,
    send_locks: DashMap<ContactId, Arc<AsyncMutex<()>>>,
    delivery_locks: DashMap<ContactId, Arc<AsyncMutex<()>>>,
    tickets: DashMap<MessageId, Arc<AtomicU8>>,
    online: DashMap<ContactId, bool>,
    seen: Mutex<SeenCache>,
}

impl Inner {
    fn lock_in(map: &DashMap<ContactId, Arc<AsyncMutex<()>>>, contact_id: &ContactId) -> Arc<AsyncMutex<()>> {
        map.entry(contact_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn pipeline(self: &Arc<Self>, contact_id: &ContactId) -> mpsc::UnboundedSender<Job> {
        self.pipelines
            .entry(contact_id.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(run_pipeline(Arc::downgrade(self), contact_id.clone(), rx));
                tx
            })
            .clone()
    }

    fn enqueue(self: &Arc<Self>, contact_id: &ContactId, message_id: MessageId) {
        let ticket = Arc::new(AtomicU8::new(QUEUED));
        self.tickets.insert(message_id, ticket.clone());

        let job = Job { message_id, ticket };
        if let Err(mpsc::error::SendError(job)) = self.pipeline(contact_id).send(job) {
            // The pipeline task is gone; start a new one
            self.pipelines.remove(contact_id);
            if self.pipeline(contact_id).send(job).is_err() {
                error!(%message_id, "Could not schedule delivery");
            }
        }
    }

    async fn dispatch(&self, job: Job) {
        let message_id = job.message_id;
        let claimed = job
            .ticket
            .compare_exchange(QUEUED, DISPATCHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.tickets
            .remove_if(&message_id, |_, ticket| Arc::ptr_eq(ticket, &job.ticket));
        if !claimed {
            debug!(%message_id, "Skipping cancelled message");
            return;
        }

        let mut envelope = match self.envelopes.load_envelope(&message_id).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => {
                warn!(%message_id, "Scheduled message has no envelope");
                return;
            }
            Err(e) => {
                error!(%message_id, "Could not load envelope: {}", e);
                return;
            }
        };

        let lock = Self::lock_in(&self.delivery_locks, &envelope.contact_id);
        let _guard = lock.lock().await;

        // Reload under the lock; a confirmation may have landed meanwhile
        if let Ok(Some(latest)) = self.envelopes.load_envelope(&message_id).await {
            envelope = latest;
        }
        if !envelope.status.is_outstanding() {
            return;
        }

        match self.executor.send(&mut envelope).await {
            Ok(outcome) => debug!(%message_id, status = ?outcome.status, "Send finished"),
            Err(e) => error!(%message_id, "Delivery failed: {}", e),
        }
    }

    async fn redeliver(self: &Arc<Self>, contact_id: &ContactId, live_eligible_only: bool) -> Result<usize> {
        let mut scheduled = 0;
        for entry in self.offline.dequeue_deliverable(contact_id).await? {
            match self.envelopes.load_envelope(&entry.message_id).await? {
                Some(envelope) if envelope.status == DeliveryStatus::QueuedOffline => {
                    if live_eligible_only && envelope.attempt_count >= self.config.max_live_attempts {
                        continue;
                    }
                    self.enqueue(contact_id, entry.message_id);
                    scheduled += 1;
                }
                Some(_) => {}
                None => warn!(message_id = %entry.message_id, "Offline entry without envelope"),
            }
        }
        Ok(scheduled)
    }

    fn schedule_retries(self: &Arc<Self>, contact_id: &ContactId) {
        let retry = self.config.retry.clone();
        if retry.max_retries == 0 {
            return;
        }

        let inner = Arc::downgrade(self);
        let contact_id = contact_id.clone();
        tokio::spawn(async move {
            for attempt in 0..retry.max_retries {
                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                let Some(inner) = inner.upgrade() else { return };
                if !inner.network.reachability(&contact_id).is_online {
                    return;
                }
                match inner.redeliver(&contact_id, true).await {
                    Ok(0) => return,
                    Ok(n) => debug!(contact = %contact_id, attempt, "Redelivering {} messages", n),
                    Err(e) => {
                        warn!(contact = %contact_id, "Redelivery failed: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Timestamp::now();
        let purged = self.offline.purge_expired_entries(now).await?;
        for entry in &purged {
            let lock = Self::lock_in(&self.delivery_locks, &entry.contact_id);
            let _guard = lock.lock().await;

            if let Some(mut envelope) = self.envelopes.load_envelope(&entry.message_id).await? {
                if envelope.status == DeliveryStatus::QueuedOffline {
                    self.transitions
                        .apply(&mut envelope, |e| e.fail(FailureReason::Expired))
                        .await?;
                }
            }
        }

        if !purged.is_empty() {
            info!("Expired {} offline messages", purged.len());
        }

        let removed = self
            .envelopes
            .purge_finished(now.minus(self.config.envelope_retention()))
            .await?;
        if removed > 0 {
            debug!("Dropped {} finished envelopes past retention", removed);
        }
        Ok(purged.len())
    }
}

async fn run_pipeline(
    inner: Weak<Inner>,
    contact_id: ContactId,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    debug!(contact = %contact_id, "Pipeline started");
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.dispatch(job).await;
    }
    debug!(contact = %contact_id, "Pipeline stopped");
}

/// Public entry point of the delivery core
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageCoordinator {
    inner: Arc<Inner>,
}

impl MessageCoordinator {
    /// Start building a coordinator
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Our contact id
    pub fn own_id(&self) -> &ContactId {
        self.inner.engine.own_id()
    }

    /// The ratchet engine, for explicit handshakes
    pub fn engine(&self) -> &RatchetEngine {
        &self.inner.engine
    }

    /// Configuration in effect
    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    /// Send a message; returns once it is sealed and persisted
    pub async fn send_text(
        &self,
        contact_id: &ContactId,
        plaintext: impl AsRef<[u8]>,
    ) -> Result<MessageId> {
        self.send_text_with_id(MessageId::new(), contact_id, plaintext)
            .await
    }

    /// Send with a caller-chosen id
    ///
    /// Resubmitting an id that is already known is a no-op, so callers can
    /// retry blindly. Handshake and missing-session errors come back here;
    /// everything after sealing happens in the background.
    #[instrument(skip(self, plaintext), fields(contact = %contact_id))]
    pub async fn send_text_with_id(
        &self,
        message_id: MessageId,
        contact_id: &ContactId,
        plaintext: impl AsRef<[u8]>,
    ) -> Result<MessageId> {
        let lock = Inner::lock_in(&self.inner.send_locks, contact_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.inner.envelopes.load_envelope(&message_id).await? {
            if &existing.contact_id != contact_id {
                return Err(DeliveryError::InvalidEnvelope(format!(
                    "message id {} already used for another contact",
                    message_id
                )));
            }
            debug!(%message_id, "Message already submitted");
            return Ok(message_id);
        }

        let sealed = self
            .inner
            .engine
            .seal(contact_id, message_id, plaintext.as_ref())
            .await?;
        let wire = WireEnvelope::new(message_id, self.own_id().clone(), sealed).encode()?;

        let envelope = OutboundEnvelope::new(message_id, contact_id.clone(), wire);
        self.inner.envelopes.save_envelope(&envelope).await?;
        self.inner.events.emit(DeliveryEvent::status_of(&envelope));
        self.inner.enqueue(contact_id, message_id);

        debug!(%message_id, "Message submitted");
        Ok(message_id)
    }

    /// Handle bytes that arrived on any path
    ///
    /// Authentication failures, desyncs and refused handshakes are reported
    /// as events and outcomes, never as errors; only storage and malformed
    /// envelopes fail the call.
    #[instrument(skip(self, raw), fields(len = raw.len()))]
    pub async fn on_incoming(&self, raw: &[u8]) -> Result<IncomingOutcome> {
        let wire = WireEnvelope::decode(raw)?;
        let message_id = wire.message_id;
        let sender = wire.sender.clone();

        if self.inner.seen.lock().contains(&sender, message_id) {
            debug!(%message_id, "Duplicate message");
            return Ok(IncomingOutcome::Duplicate(message_id));
        }

        let events = &self.inner.events;
        match self.inner.engine.unseal(&sender, message_id, &wire.sealed).await {
            Ok(unsealed) => {
                if !self.inner.seen.lock().insert(&sender, message_id) {
                    return Ok(IncomingOutcome::Duplicate(message_id));
                }
                if unsealed.session == SessionChange::Replaced {
                    events.emit(DeliveryEvent::SessionReset {
                        contact_id: sender.clone(),
                    });
                }
                events.emit(DeliveryEvent::MessageReceived {
                    message_id,
                    contact_id: sender.clone(),
                    body: unsealed.plaintext,
                    received_at: Timestamp::now(),
                });
                info!(%message_id, from = %sender, "Message received");
                Ok(IncomingOutcome::Received {
                    message_id,
                    contact_id: sender,
                })
            }
            Err(DeliveryError::Replay { .. }) => {
                self.inner.seen.lock().insert(&sender, message_id);
                debug!(%message_id, "Replayed message");
                Ok(IncomingOutcome::Duplicate(message_id))
            }
            Err(e @ DeliveryError::Decryption { .. }) => {
                warn!(%message_id, "Undecryptable message: {}", e);
                events.emit(DeliveryEvent::Undecryptable {
                    message_id,
                    contact_id: sender,
                    reason: e.to_string(),
                });
                Ok(IncomingOutcome::Undecryptable(message_id))
            }
            Err(e @ (DeliveryError::TooManySkippedMessages { .. } | DeliveryError::NoSession(_))) => {
                warn!(%message_id, "Session desync: {}", e);
                events.emit(DeliveryEvent::SessionDesync {
                    contact_id: sender,
                    reason: e.to_string(),
                });
                Ok(IncomingOutcome::Desynced(message_id))
            }
            Err(e @ DeliveryError::Handshake { .. }) => {
                warn!(%message_id, "Handshake rejected: {}", e);
                events.emit(DeliveryEvent::HandshakeFailed {
                    contact_id: sender,
                    reason: e.to_string(),
                });
                Ok(IncomingOutcome::HandshakeRejected(message_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Every delivery event from now on
    pub fn subscribe(&self) -> UnboundedReceiverStream<DeliveryEvent> {
        self.inner.events.subscribe()
    }

    /// Status updates for one message
    ///
    /// Starts with the current status and ends after Delivered.
    pub async fn on_status_changed(
        &self,
        message_id: MessageId,
    ) -> Result<BoxStream<'static, DeliveryStatus>> {
        struct Watch {
            first: Option<DeliveryStatus>,
            last: Option<DeliveryStatus>,
            events: UnboundedReceiverStream<DeliveryEvent>,
            done: bool,
        }

        let events = self.inner.events.subscribe();
        let current = self
            .status(message_id)
            .await?
            .ok_or(DeliveryError::UnknownMessage(message_id))?;

        let watch = Watch {
            first: Some(current),
            last: None,
            events,
            done: false,
        };

        let updates = stream::unfold(watch, move |mut watch| async move {
            if watch.done {
                return None;
            }
            let next = match watch.first.take() {
                Some(status) => status,
                None => loop {
                    match watch.events.next().await? {
                        DeliveryEvent::StatusChanged {
                            message_id: id,
                            status,
                            ..
                        } if id == message_id && Some(status) != watch.last => break status,
                        _ => continue,
                    }
                },
            };
            watch.last = Some(next);
            watch.done = next == DeliveryStatus::Delivered;
            Some((next, watch))
        });

        Ok(updates.boxed())
    }

    /// Current status of an outgoing message
    pub async fn status(&self, message_id: MessageId) -> Result<Option<DeliveryStatus>> {
        Ok(self
            .inner
            .envelopes
            .load_envelope(&message_id)
            .await?
            .map(|e| e.status))
    }

    /// Full envelope of an outgoing message
    pub async fn envelope(&self, message_id: MessageId) -> Result<Option<OutboundEnvelope>> {
        Ok(self.inner.envelopes.load_envelope(&message_id).await?)
    }

    /// Cancel a message that has not been handed to a path yet
    ///
    /// Returns false once dispatch has started; delivery then runs to
    /// completion or to the offline queue.
    #[instrument(skip(self))]
    pub async fn cancel(&self, message_id: MessageId) -> Result<bool> {
        let mut envelope = self
            .inner
            .envelopes
            .load_envelope(&message_id)
            .await?
            .ok_or(DeliveryError::UnknownMessage(message_id))?;
        if envelope.status != DeliveryStatus::Pending {
            return Ok(false);
        }

        let Some(ticket) = self.inner.tickets.get(&message_id).map(|t| t.value().clone()) else {
            return Ok(false);
        };
        if ticket
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        self.inner
            .transitions
            .apply(&mut envelope, |e| e.fail(FailureReason::Cancelled))
            .await?;
        info!("Message cancelled");
        Ok(true)
    }

    /// Put a Failed message back on its pipeline
    #[instrument(skip(self))]
    pub async fn retry(&self, message_id: MessageId) -> Result<()> {
        let mut envelope = self
            .inner
            .envelopes
            .load_envelope(&message_id)
            .await?
            .ok_or(DeliveryError::UnknownMessage(message_id))?;

        self.inner
            .transitions
            .apply(&mut envelope, |e| e.transition(DeliveryStatus::Pending))
            .await?;
        self.inner.enqueue(&envelope.contact_id, message_id);

        info!("Message retried");
        Ok(())
    }

    /// Record an external acknowledgement that a message arrived
    ///
    /// Used for messages that went through the store-and-forward server.
    #[instrument(skip(self))]
    pub async fn confirm_delivered(&self, message_id: MessageId) -> Result<()> {
        let contact_id = self
            .inner
            .envelopes
            .load_envelope(&message_id)
            .await?
            .ok_or(DeliveryError::UnknownMessage(message_id))?
            .contact_id;

        let lock = Inner::lock_in(&self.inner.delivery_locks, &contact_id);
        let _guard = lock.lock().await;

        let mut envelope = self
            .inner
            .envelopes
            .load_envelope(&message_id)
            .await?
            .ok_or(DeliveryError::UnknownMessage(message_id))?;
        if envelope.status != DeliveryStatus::Delivered {
            self.inner
                .transitions
                .apply(&mut envelope, |e| e.transition(DeliveryStatus::Delivered))
                .await?;
        }
        self.inner.offline.remove(&message_id).await?;

        info!("Delivery confirmed");
        Ok(())
    }

    /// React to a reachability update from the networking layer
    ///
    /// When a contact goes from offline to online, expired entries are purged
    /// and the contact's queued messages are redelivered. Returns how many
    /// were scheduled.
    #[instrument(skip(self, reachability), fields(online = reachability.is_online))]
    pub async fn on_reachability_changed(
        &self,
        contact_id: &ContactId,
        reachability: &PeerReachability,
    ) -> Result<usize> {
        let was_online = self
            .inner
            .online
            .insert(contact_id.clone(), reachability.is_online)
            .unwrap_or(false);
        if !reachability.is_online || was_online {
            return Ok(0);
        }

        info!("Contact came online");
        self.inner.purge_expired().await?;
        let scheduled = self.inner.redeliver(contact_id, false).await?;
        if scheduled > 0 {
            self.inner.schedule_retries(contact_id);
        }
        Ok(scheduled)
    }

    /// Pull and process everything the store-and-forward server holds for us
    #[instrument(skip(self))]
    pub async fn poll_stored(&self) -> Result<Vec<IncomingOutcome>> {
        let blobs = self.inner.network.fetch_stored(self.own_id()).await?;
        debug!("Fetched {} stored messages", blobs.len());

        let mut outcomes = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match self.on_incoming(&blob).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e @ DeliveryError::InvalidEnvelope(_)) => warn!("Dropping stored blob: {}", e),
                Err(e) => error!("Could not process stored blob: {}", e),
            }
        }
        Ok(outcomes)
    }

    /// Purge expired offline entries, failing their envelopes
    ///
    /// Also drops Delivered and Failed envelopes older than the configured
    /// retention; their ids are unknown afterwards.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired().await
    }

    /// Re-drive every unfinished envelope, e.g. after a restart
    ///
    /// Envelopes interrupted mid-attempt go back to Pending first.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<usize> {
        self.inner.purge_expired().await?;

        let unfinished = self
            .inner
            .envelopes
            .envelopes_with_status(&[
                DeliveryStatus::Pending,
                DeliveryStatus::InFlightDirect,
                DeliveryStatus::InFlightRelay,
                DeliveryStatus::QueuedOffline,
            ])
            .await?;

        for mut envelope in unfinished.iter().cloned() {
            if envelope.recover_interrupted() {
                debug!(message_id = %envelope.message_id, "Recovered interrupted attempt");
                self.inner.envelopes.save_envelope(&envelope).await?;
            }
            self.inner.enqueue(&envelope.contact_id, envelope.message_id);
        }

        if !unfinished.is_empty() {
            info!("Resumed {} unfinished messages", unfinished.len());
        }
        Ok(unfinished.len())
    }

    /// Delete the session with a contact; the next send starts a new handshake
    pub async fn reset_session(&self, contact_id: &ContactId) -> Result<bool> {
        let removed = self.inner.engine.reset_session(contact_id).await?;
        if removed {
            self.inner.events.emit(DeliveryEvent::SessionReset {
                contact_id: contact_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Describe the session with a contact
    pub async fn session(&self, contact_id: &ContactId) -> Result<Option<SessionHandle>> {
        self.inner.engine.session(contact_id).await
    }

    /// Purge expired offline entries on an interval until the coordinator is dropped
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.purge_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; build already purged
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                if let Err(e) = inner.purge_expired().await {
                    warn!("Periodic purge failed: {}", e);
                }
            }
        })
    }
}

/// Wires a [`MessageCoordinator`] together
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: DeliveryConfig,
    keystore: Option<Arc<dyn Keystore>>,
    network: Option<Arc<dyn PeerNetwork>>,
    stores: Option<Stores>,
}

impl CoordinatorBuilder {
    /// Use this configuration
    pub fn config(mut self, config: DeliveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Key material source
    pub fn keystore(mut self, keystore: Arc<dyn Keystore>) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Networking layer
    pub fn network(mut self, network: Arc<dyn PeerNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Explicit storage, overriding `config.storage`
    pub fn storage<S>(mut self, storage: Arc<S>) -> Self
    where
        S: SessionStore + EnvelopeStore + OfflineStore + 'static,
    {
        self.stores = Some(Stores::of(storage));
        self
    }

    /// Persist with sled at `path`, overriding `config.storage`
    pub fn sled_storage(self, path: impl AsRef<Path>) -> Result<Self> {
        let storage = SledStorage::open(path)?;
        Ok(self.storage(Arc::new(storage)))
    }

    /// Build, purge expired entries and resume unfinished envelopes
    pub async fn build(self) -> Result<MessageCoordinator> {
        self.config.validate().map_err(DeliveryError::Config)?;
        let keystore = self
            .keystore
            .ok_or_else(|| DeliveryError::Config("a keystore is required".to_string()))?;
        let network = self
            .network
            .ok_or_else(|| DeliveryError::Config("a network is required".to_string()))?;

        let stores = match self.stores {
            Some(stores) => stores,
            None => match &self.config.storage.path {
                Some(path) => {
                    info!(path = %path.display(), "Opening persistent storage");
                    Stores::of(Arc::new(SledStorage::open(path)?))
                }
                None => Stores::of(Arc::new(MemoryStorage::new())),
            },
        };

        let config = self.config;
        let events = EventBus::new();
        let engine = RatchetEngine::new(keystore, stores.sessions, config.max_skipped_messages)?;
        let executor = DeliveryExecutor::new(
            config.clone(),
            network.clone(),
            stores.envelopes.clone(),
            stores.offline.clone(),
            events.clone(),
        );

        let coordinator = MessageCoordinator {
            inner: Arc::new(Inner {
                transitions: Transitions::new(stores.envelopes.clone(), events.clone()),
                seen: Mutex::new(SeenCache::new(config.seen_cache_size)),
                config,
                engine,
                executor,
                network,
                envelopes: stores.envelopes,
                offline: stores.offline,
                events,
                pipelines: DashMap::new(),
                send_locks: DashMap::new(),
                delivery_locks: DashMap::new(),
                tickets: DashMap::new(),
                online: DashMap::new(),
            }),
        };

        let resumed = coordinator.resume().await?;
        info!(own_id = %coordinator.own_id(), resumed, "Coordinator ready");
        Ok(coordinator)
    }
}
