//! Glue between local mutations, the outbox, the transport and the inbound
//! apply path.
//!
//! Outbound: edit the order, save it together with its outbox entry in one
//! transaction, wake the drain. The drain broadcasts pending entries and
//! leaves them SENDING until a peer ACKs.
//! Inbound: verify checksum, drop known ids with an ACK, decode, resolve and
//! apply together with the ledger insert, then ACK. Everything that cannot
//! be applied is NACKed with a reason the sender feeds into its retry
//! schedule.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::checksum;
use crate::config::SyncConfig;
use crate::dead_letter::{DeadLetterRecord, DeadLetterVault, Operator, ResolutionAction};
use crate::ledger::{IdempotencyLedger, ProcessedMessageRecord};
use crate::metrics::{SyncMetrics, SyncStatus};
use crate::model::{DeviceId, ItemId, MessageId, OrderId, OrderStatus, UnixTimeMs};
use crate::order::{ApplyEffect, ApplyError, LineItem, Order, OrderMutation};
use crate::outbox::{FailureOutcome, Outbox, OutboxEntry, OutboxError};
use crate::retry::FailureKind;
use crate::store::{ApplyOutcome, StorageError, SyncStore};
use crate::transport::{InboundFrame, PeerHandle, Transport};
use crate::wire::{self, Frame, WireMessage};
use crate::SyncError;

/// Replays of a local edit that keeps losing to concurrent writes.
const MAX_LOCAL_COMMIT_ATTEMPTS: u32 = 8;

/// What one drain pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub expired: usize,
    pub promoted: usize,
    pub frames_sent: usize,
    pub messages_sent: usize,
    pub retries_scheduled: usize,
    pub escalated: usize,
    /// No peer was reachable, so nothing was attempted.
    pub offline: bool,
}

impl DrainReport {
    fn record(&mut self, outcome: &FailureOutcome) {
        match outcome {
            FailureOutcome::Retrying { .. } => self.retries_scheduled += 1,
            FailureOutcome::Escalated(_) => self.escalated += 1,
        }
    }
}

/// How an inbound message was handled. Decides the reply frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    Applied { message_id: MessageId, changed: bool },
    Duplicate { message_id: MessageId },
    Rejected {
        message_id: MessageId,
        reason: FailureKind,
        detail: Option<String>,
    },
}

impl InboundOutcome {
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Applied { message_id, .. }
            | Self::Duplicate { message_id }
            | Self::Rejected { message_id, .. } => *message_id,
        }
    }

    fn rejected(message_id: MessageId, reason: FailureKind, detail: impl Into<String>) -> Self {
        Self::Rejected {
            message_id,
            reason,
            detail: Some(detail.into()),
        }
    }

    fn reply(&self, receiver_id: &DeviceId) -> Frame {
        match self {
            Self::Applied { message_id, .. } | Self::Duplicate { message_id } => Frame::Ack {
                message_id: *message_id,
                receiver_id: receiver_id.clone(),
            },
            Self::Rejected {
                message_id,
                reason,
                detail,
            } => Frame::Nack {
                message_id: *message_id,
                receiver_id: receiver_id.clone(),
                reason: *reason,
                detail: detail.clone(),
            },
        }
    }
}

pub struct SyncCoordinator<S, T>
where
    S: SyncStore + ?Sized,
    T: Transport + ?Sized,
{
    config: SyncConfig,
    store: Arc<S>,
    transport: Arc<T>,
    outbox: Outbox<S>,
    ledger: IdempotencyLedger<S>,
    vault: DeadLetterVault<S>,
    metrics: Arc<SyncMetrics>,
    wake: Notify,
}

impl<S, T> SyncCoordinator<S, T>
where
    S: SyncStore + ?Sized,
    T: Transport + ?Sized,
{
    pub fn new(config: SyncConfig, store: Arc<S>, transport: Arc<T>) -> Result<Self, SyncError> {
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new());
        let outbox = Outbox::new(Arc::clone(&store), config.outbox_config(), Arc::clone(&metrics))?;
        let ledger = IdempotencyLedger::new(
            Arc::clone(&store),
            config.ledger_cache_size,
            config.ledger_retention(),
            Arc::clone(&metrics),
        );
        let vault = DeadLetterVault::new(Arc::clone(&store));

        Ok(Self {
            config,
            store,
            transport,
            outbox,
            ledger,
            vault,
            metrics,
            wake: Notify::new(),
        })
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn outbox(&self) -> &Outbox<S> {
        &self.outbox
    }

    #[must_use]
    pub fn ledger(&self) -> &IdempotencyLedger<S> {
        &self.ledger
    }

    #[must_use]
    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    pub async fn create_order(&self, table_id: Option<String>) -> Result<Order, SyncError> {
        let order = Order::new(table_id);
        self.commit(None, &order, &order.created()).await?;
        Ok(order)
    }

    pub async fn add_line_item(&self, order_id: &OrderId, item: LineItem) -> Result<Order, SyncError> {
        self.mutate(order_id, |order| Ok(order.add_line_item(item.clone())))
            .await
    }

    pub async fn claim_item(
        &self,
        order_id: &OrderId,
        item_id: &ItemId,
        claimed_by: impl Into<String>,
    ) -> Result<Order, SyncError> {
        let claimed_by = claimed_by.into();
        self.mutate(order_id, |order| order.claim_item(item_id, claimed_by.as_str()))
            .await
    }

    pub async fn update_order(
        &self,
        order_id: &OrderId,
        table_id: Option<String>,
        note: Option<String>,
    ) -> Result<Order, SyncError> {
        self.mutate(order_id, |order| {
            Ok(order.update_details(table_id.clone(), note.clone()))
        })
        .await
    }

    pub async fn change_status(&self, order_id: &OrderId, status: OrderStatus) -> Result<Order, SyncError> {
        self.mutate(order_id, |order| Ok(order.set_status(status.clone())))
            .await
    }

    pub async fn order(&self, order_id: &OrderId) -> Result<Option<Order>, SyncError> {
        Ok(self.store.load_order(order_id).await?)
    }

    pub async fn orders(&self) -> Result<Vec<Order>, SyncError> {
        Ok(self.store.list_orders().await?)
    }

    /// Load, edit, then commit against the loaded copy. A concurrent write to
    /// the same order (local or inbound) makes the commit fail with a
    /// conflict, and the edit is replayed on the fresh row.
    async fn mutate<F>(&self, order_id: &OrderId, mut edit: F) -> Result<Order, SyncError>
    where
        F: FnMut(&mut Order) -> Result<OrderMutation, ApplyError>,
    {
        let mut attempt = 1;
        loop {
            let previous = self
                .store
                .load_order(order_id)
                .await?
                .ok_or_else(|| SyncError::OrderNotFound(order_id.clone()))?;
            let mut order = previous.clone();
            let mutation = edit(&mut order)?;

            match self.commit(Some(&previous), &order, &mutation).await {
                Ok(_) => return Ok(order),
                Err(SyncError::Storage(StorageError::Conflict { .. }))
                    if attempt < MAX_LOCAL_COMMIT_ATTEMPTS =>
                {
                    debug!(order_id = %order_id, attempt, "Order changed during edit, replaying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists the edited order and the outbox entry for `mutation`
    /// atomically, then wakes the drain. Nothing is written when the outbox
    /// is full or the order moved on since `previous` was read.
    #[instrument(skip(self, previous, order, mutation), fields(order_id = %mutation.order_id(), message_type = %mutation.message_type()))]
    async fn commit(
        &self,
        previous: Option<&Order>,
        order: &Order,
        mutation: &OrderMutation,
    ) -> Result<OutboxEntry, SyncError> {
        let payload = mutation.to_payload()?;
        let entry = self
            .outbox
            .prepare(OutboxEntry::new(mutation.message_type(), payload, mutation.version()))?;

        let written = self
            .store
            .commit_local(previous, order, &entry, self.outbox.max_entries())
            .await;
        let entry = match written {
            Err(e @ StorageError::Conflict { .. }) => return Err(e.into()),
            written => self.outbox.admit(entry, written)?,
        };
        self.wake.notify_one();
        Ok(entry)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// One pass of the drain: time out unacknowledged sends, promote entries
    /// whose backoff elapsed, then broadcast what is pending.
    #[instrument(skip(self), fields(device = %self.config.device_id))]
    pub async fn drain_once(&self, now: UnixTimeMs) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();

        for (_, outcome) in self
            .outbox
            .expire_unacknowledged(now, self.config.ack_timeout())
            .await?
        {
            report.expired += 1;
            report.record(&outcome);
        }
        report.promoted = self.outbox.promote_due(now).await?;

        if self.transport.reachable_peers().is_empty() {
            report.offline = true;
            return Ok(report);
        }

        let pending = self
            .outbox
            .dequeue_pending(self.config.max_messages_per_drain)
            .await?;
        let delay = self.config.inter_message_delay();

        for (i, chunk) in pending.chunks(self.config.max_batch_size).enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.transmit(chunk, now, &mut report).await?;
        }

        if report.messages_sent > 0 {
            debug!(
                frames = report.frames_sent,
                messages = report.messages_sent,
                "Drain pass sent"
            );
        }
        Ok(report)
    }

    async fn transmit(
        &self,
        chunk: &[OutboxEntry],
        now: UnixTimeMs,
        report: &mut DrainReport,
    ) -> Result<(), SyncError> {
        let mut in_flight = Vec::with_capacity(chunk.len());
        for entry in chunk {
            match self.outbox.mark_sending(&entry.message_id, now).await {
                Ok(sending) => in_flight.push(sending),
                // Acked or failed concurrently.
                Err(
                    OutboxError::NotFound(_)
                    | OutboxError::InvalidStateTransition { .. }
                    | OutboxError::ConcurrentModification(_),
                ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if in_flight.is_empty() {
            return Ok(());
        }

        let messages: Vec<WireMessage> = in_flight
            .iter()
            .map(|e| WireMessage::from_entry(e, &self.config.device_id))
            .collect();
        let frame = match <[WireMessage; 1]>::try_from(messages) {
            Ok([single]) => Frame::Message(single),
            Err(messages) => Frame::batch(messages),
        };
        let bytes = frame.encode()?;

        let failure = match timeout(self.config.send_timeout(), self.transport.broadcast(bytes)).await {
            Ok(Ok(0)) => Some("no peer reached".to_string()),
            Ok(Ok(reached)) => {
                report.frames_sent += 1;
                report.messages_sent += in_flight.len();
                debug!(reached, count = in_flight.len(), "Frame broadcast");
                None
            }
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("send timed out after {}ms", self.config.send_timeout_ms)),
        };

        if let Some(error) = failure {
            warn!("Transmission failed: {}", error);
            for entry in &in_flight {
                let outcome = self
                    .outbox
                    .mark_failed(&entry.message_id, FailureKind::TransientTransport, error.clone(), now)
                    .await?;
                report.record(&outcome);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Decodes one raw frame from a peer and acts on it. Replies are sent
    /// back to the same peer.
    #[instrument(skip(self, frame), fields(peer = %frame.peer.device_id))]
    pub async fn handle_frame(&self, frame: InboundFrame) -> Result<(), SyncError> {
        self.metrics.frames_received.fetch_add(1, Ordering::Relaxed);

        let decoded = match Frame::decode(&frame.bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                return Ok(());
            }
        };

        match decoded {
            Frame::Message(message) => {
                let outcome = self.process_message(&message).await?;
                self.reply(&frame.peer, &outcome).await;
            }
            Frame::Batch {
                messages,
                batch_checksum,
            } => {
                if let Err(e) = wire::verify_batch(&messages, &batch_checksum) {
                    warn!(count = messages.len(), "Batch checksum mismatch: {}", e);
                    for message in &messages {
                        self.metrics.checksum_rejections.fetch_add(1, Ordering::Relaxed);
                        let outcome = InboundOutcome::rejected(
                            message.message_id,
                            FailureKind::ChecksumMismatch,
                            e.to_string(),
                        );
                        self.reply(&frame.peer, &outcome).await;
                    }
                    return Ok(());
                }
                for message in &messages {
                    let outcome = self.process_message(message).await?;
                    self.reply(&frame.peer, &outcome).await;
                }
            }
            Frame::Ack { message_id, receiver_id } => {
                if self.outbox.mark_sent(&message_id).await? {
                    debug!(message_id = %message_id, receiver = %receiver_id, "Acknowledged");
                }
            }
            Frame::Nack {
                message_id,
                receiver_id,
                reason,
                detail,
            } => {
                warn!(
                    message_id = %message_id,
                    receiver = %receiver_id,
                    reason = reason.as_str(),
                    "Peer rejected message"
                );
                let detail = detail.unwrap_or_else(|| reason.as_str().to_string());
                match self
                    .outbox
                    .mark_failed(&message_id, reason, detail, UnixTimeMs::now())
                    .await
                {
                    Ok(_) => {}
                    // Another peer already acknowledged or failed it.
                    Err(
                        OutboxError::NotFound(_)
                        | OutboxError::InvalidStateTransition { .. }
                        | OutboxError::ConcurrentModification(_),
                    ) => debug!(message_id = %message_id, "Ignoring late NACK"),
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Verifies, deduplicates and applies a single message.
    ///
    /// Returns `Err` only when local storage fails; the message is then left
    /// unacknowledged and the sender retries it.
    #[instrument(skip(self, message), fields(message_id = %message.message_id, sender = %message.sender_id))]
    pub async fn process_message(&self, message: &WireMessage) -> Result<InboundOutcome, SyncError> {
        let message_id = message.message_id;

        if let Err(e) = checksum::verify(&message.payload, &message.checksum) {
            self.metrics.checksum_rejections.fetch_add(1, Ordering::Relaxed);
            warn!("Checksum mismatch: {}", e);
            return Ok(InboundOutcome::rejected(
                message_id,
                FailureKind::ChecksumMismatch,
                e.to_string(),
            ));
        }

        if self.ledger.is_processed(&message_id).await? {
            self.metrics.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Duplicate delivery");
            return Ok(InboundOutcome::Duplicate { message_id });
        }

        let message_type = match message.parsed_type() {
            Ok(message_type) => message_type,
            Err(e) => {
                warn!("Unknown message type {}", message.message_type);
                return Ok(InboundOutcome::rejected(
                    message_id,
                    FailureKind::PeerRejected,
                    e.to_string(),
                ));
            }
        };

        let mutation = match OrderMutation::from_payload(message_type, &message.payload) {
            Ok(mutation) => mutation,
            Err(e) => {
                warn!("Undecodable payload: {}", e);
                return Ok(InboundOutcome::rejected(message_id, e.failure_kind(), e.to_string()));
            }
        };

        let record = ProcessedMessageRecord::new(
            message_id,
            message_type,
            message.sender_id.clone(),
            message.checksum.clone(),
            &message.payload,
            UnixTimeMs::now(),
        );

        let outcome = self
            .store
            .apply_and_record(&mutation, &record, self.config.status_precedence)
            .await?;

        match outcome {
            ApplyOutcome::Duplicate => {
                self.metrics.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                self.ledger.remember(message_id, record.processed_at).await;
                Ok(InboundOutcome::Duplicate { message_id })
            }
            ApplyOutcome::Applied(effect) => {
                self.metrics.mutations_applied.fetch_add(1, Ordering::Relaxed);
                self.ledger.remember(message_id, record.processed_at).await;
                let changed = matches!(effect, ApplyEffect::Upserted(_));
                info!(changed, order_id = %mutation.order_id(), "Applied remote mutation");
                Ok(InboundOutcome::Applied { message_id, changed })
            }
            ApplyOutcome::Rejected(e) => {
                warn!("Cannot apply yet: {}", e);
                Ok(InboundOutcome::rejected(message_id, e.failure_kind(), e.to_string()))
            }
        }
    }

    async fn reply(&self, peer: &PeerHandle, outcome: &InboundOutcome) {
        let frame = outcome.reply(&self.config.device_id);
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                return;
            }
        };

        let counter = match frame {
            Frame::Nack { .. } => &self.metrics.nacks_sent,
            _ => &self.metrics.acks_sent,
        };

        // An undelivered reply only costs the sender a retry; the ledger
        // absorbs the redelivery.
        match timeout(self.config.send_timeout(), self.transport.send(peer, bytes)).await {
            Ok(Ok(true)) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ok(false)) => debug!(peer = %peer.device_id, "Reply peer unreachable"),
            Ok(Err(e)) => warn!(peer = %peer.device_id, "Reply failed: {}", e),
            Err(_) => warn!(peer = %peer.device_id, "Reply timed out"),
        }
    }

    // ========================================================================
    // Operator surface
    // ========================================================================

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, SyncError> {
        Ok(self.vault.unresolved().await?)
    }

    pub async fn resolve_dead_letter(
        &self,
        id: Uuid,
        operator: &Operator,
        action: ResolutionAction,
        notes: Option<String>,
    ) -> Result<DeadLetterRecord, SyncError> {
        let record = self.vault.resolve(id, operator, action, notes).await?;
        if action == ResolutionAction::Requeue {
            self.wake.notify_one();
        }
        Ok(record)
    }

    pub async fn purge_dead_letters(
        &self,
        operator: &Operator,
        cutoff: UnixTimeMs,
    ) -> Result<usize, SyncError> {
        Ok(self.vault.purge_resolved(operator, cutoff).await?)
    }

    pub async fn status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            pending_outbound: self.outbox.active_count().await?,
            unresolved_dead_letters: self.vault.unresolved_count().await?,
            reachable_peers: self.transport.reachable_peers().len(),
            metrics: self.metrics.snapshot(),
        })
    }

    pub async fn cleanup_ledger(&self, now: UnixTimeMs) -> Result<usize, SyncError> {
        Ok(self.ledger.cleanup(now).await?)
    }

    // ========================================================================
    // Background loop
    // ========================================================================

    /// Runs until `shutdown` flips to `true` or the inbound channel closes.
    ///
    /// Shutdown interrupts an in-progress drain. Entries it left SENDING are
    /// returned to PENDING on the next start.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let recovered = self.outbox.recover_in_flight().await?;
        info!(device = %self.config.device_id, recovered, "Sync coordinator started");

        let mut discovered = self.transport.discover().await;
        let mut drain_tick = tokio::time::interval(self.config.drain_interval());
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(self.config.ledger_cleanup_interval());
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let should_drain = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    false
                }
                frame = inbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = self.handle_frame(frame).await {
                            error!("Inbound frame failed: {}", e);
                        }
                        false
                    }
                    None => {
                        info!("Inbound channel closed");
                        break;
                    }
                },
                Some(peer) = discovered.recv() => {
                    info!(peer = %peer.device_id, "Peer reachable");
                    true
                }
                _ = drain_tick.tick() => true,
                () = self.wake.notified() => true,
                _ = cleanup_tick.tick() => {
                    if let Err(e) = self.ledger.cleanup(UnixTimeMs::now()).await {
                        error!("Ledger cleanup failed: {}", e);
                    }
                    false
                }
            };

            if should_drain {
                tokio::select! {
                    result = self.drain_once(UnixTimeMs::now()) => {
                        if let Err(e) = result {
                            error!("Drain failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }

        info!(device = %self.config.device_id, "Sync coordinator stopped");
        Ok(())
    }
}
