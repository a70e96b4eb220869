use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::checksum;
use crate::dead_letter::DeadLetterRecord;
use crate::metrics::SyncMetrics;
use crate::model::{HighResTimestamp, MessageId, MessageType, Priority, UnixTimeMs};
use crate::resolver;
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::store::StorageError;

// ============================================================================
// Entry
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Sending,
    /// Transient marker; a sent entry is deleted rather than stored.
    Sent,
    Failed,
}

impl EntryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sending => "SENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENDING" => Some(Self::Sending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub payload: String,
    /// Empty until `enqueue` fills it in.
    pub checksum: String,
    pub entity_version: u64,
    pub created_at: UnixTimeMs,
    pub high_res_timestamp: HighResTimestamp,
    pub priority: Priority,
    pub is_additive: bool,
    pub retry_count: u32,
    pub status: EntryStatus,
    pub last_attempt_at: Option<UnixTimeMs>,
    pub last_error: Option<String>,
    pub last_failure: Option<FailureKind>,
}

impl OutboxEntry {
    pub fn new(message_type: MessageType, payload: impl Into<String>, entity_version: u64) -> Self {
        Self {
            message_id: MessageId::generate(),
            message_type,
            payload: payload.into(),
            checksum: String::new(),
            entity_version,
            created_at: UnixTimeMs::now(),
            high_res_timestamp: HighResTimestamp::now(),
            priority: Priority::from(message_type),
            is_additive: resolver::is_additive(message_type),
            retry_count: 0,
            status: EntryStatus::Pending,
            last_attempt_at: None,
            last_error: None,
            last_failure: None,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: UnixTimeMs) -> Self {
        self.created_at = created_at;
        self
    }
}

/// What became of an entry after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        retry_count: u32,
        next_attempt_at: UnixTimeMs,
    },
    Escalated(DeadLetterRecord),
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox is full ({0} entries)")]
    Full(usize),

    #[error("duplicate message: {0}")]
    DuplicateMessageId(MessageId),

    #[error("entry not found: {0}")]
    NotFound(MessageId),

    #[error("invalid state transition for {message_id} from {from:?} to {to}")]
    InvalidStateTransition {
        message_id: MessageId,
        from: EntryStatus,
        to: &'static str,
    },

    #[error("concurrent modification of {0}")]
    ConcurrentModification(MessageId),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

const MAX_ERROR_LENGTH: usize = 512;

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

// ============================================================================
// Storage Trait
// ============================================================================

#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Fails with [`StorageError::Duplicate`] if the message id exists and
    /// with [`StorageError::Full`] if `max_entries` rows are already live.
    /// The count and the insert are one transaction.
    async fn insert_entry(&self, entry: &OutboxEntry, max_entries: usize) -> Result<(), StorageError>;
    async fn get_entry(&self, message_id: &MessageId) -> Result<Option<OutboxEntry>, StorageError>;
    /// Oldest first by creation time, then high-resolution timestamp.
    async fn load_by_status(
        &self,
        status: EntryStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StorageError>;
    /// Replaces the row only if it is still in `expected` status.
    async fn compare_and_swap(
        &self,
        message_id: &MessageId,
        expected: EntryStatus,
        updated: &OutboxEntry,
    ) -> Result<bool, StorageError>;
    async fn remove_entry(&self, message_id: &MessageId) -> Result<bool, StorageError>;
    /// Deletes the entry and inserts the dead letter in one transaction.
    async fn escalate_entry(
        &self,
        message_id: &MessageId,
        expected: EntryStatus,
        record: &DeadLetterRecord,
    ) -> Result<bool, StorageError>;
    async fn count_entries(&self) -> Result<usize, StorageError>;
    async fn checkpoint(&self) -> Result<(), StorageError>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_entries: usize,
    pub retry: RetryPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl OutboxConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.max_entries == 0 {
            return Err(OutboxError::Validation("max_entries must be > 0".into()));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(OutboxError::Validation("retry.base_delay_ms must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Outbox
// ============================================================================

pub struct Outbox<S: OutboxStorage + ?Sized> {
    storage: Arc<S>,
    config: OutboxConfig,
    metrics: Arc<SyncMetrics>,
}

impl<S: OutboxStorage + ?Sized> Outbox<S> {
    pub fn new(
        storage: Arc<S>,
        config: OutboxConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            metrics,
        })
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    /// Persists a new PENDING entry. Returns only once the entry is durable.
    #[instrument(skip(self, entry), fields(message_id = %entry.message_id, message_type = %entry.message_type))]
    pub async fn enqueue(&self, entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
        let entry = self.prepare(entry)?;
        let inserted = self.storage.insert_entry(&entry, self.config.max_entries).await;
        self.admit(entry, inserted)
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.config.max_entries
    }

    /// Checks a new entry and fills in its checksum, without writing it.
    pub(crate) fn prepare(&self, mut entry: OutboxEntry) -> Result<OutboxEntry, OutboxError> {
        if entry.status != EntryStatus::Pending || entry.retry_count != 0 {
            return Err(OutboxError::Validation(
                "new entries must be PENDING with no retries".into(),
            ));
        }
        if entry.checksum.is_empty() {
            entry.checksum = checksum::compute(&entry.payload);
        }
        Ok(entry)
    }

    /// Accounts for the result of writing a prepared entry, whichever store
    /// operation performed the insert.
    pub(crate) fn admit(
        &self,
        entry: OutboxEntry,
        inserted: Result<(), StorageError>,
    ) -> Result<OutboxEntry, OutboxError> {
        match inserted {
            Ok(()) => {}
            Err(StorageError::Full(max)) => {
                warn!(max, "Outbox full, entry rejected");
                return Err(OutboxError::Full(max));
            }
            Err(StorageError::Duplicate(_)) => {
                self.metrics.duplicate_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(OutboxError::DuplicateMessageId(entry.message_id));
            }
            Err(e) => {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                error!("Failed to persist outbox entry: {}", e);
                return Err(e.into());
            }
        }

        self.metrics.entries_enqueued.fetch_add(1, Ordering::Relaxed);
        info!(message_id = %entry.message_id, "Entry enqueued");
        Ok(entry)
    }

    /// PENDING entries in creation order.
    pub async fn dequeue_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        Ok(self.storage.load_by_status(EntryStatus::Pending, limit).await?)
    }

    pub async fn get(&self, message_id: &MessageId) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.storage.get_entry(message_id).await?)
    }

    /// PENDING -> SENDING.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub async fn mark_sending(
        &self,
        message_id: &MessageId,
        now: UnixTimeMs,
    ) -> Result<OutboxEntry, OutboxError> {
        let entry = self.require(message_id).await?;
        if entry.status != EntryStatus::Pending {
            return Err(OutboxError::InvalidStateTransition {
                message_id: *message_id,
                from: entry.status,
                to: "SENDING",
            });
        }

        let mut updated = entry;
        updated.status = EntryStatus::Sending;
        updated.last_attempt_at = Some(now);

        if !self
            .storage
            .compare_and_swap(message_id, EntryStatus::Pending, &updated)
            .await?
        {
            return Err(OutboxError::ConcurrentModification(*message_id));
        }
        Ok(updated)
    }

    /// Deletes the entry. Returns `false` when it was already gone, which
    /// happens when several peers acknowledge the same broadcast.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub async fn mark_sent(&self, message_id: &MessageId) -> Result<bool, OutboxError> {
        let removed = self.storage.remove_entry(message_id).await?;
        if removed {
            self.metrics.entries_sent.fetch_add(1, Ordering::Relaxed);
            info!("Entry delivered");
        }
        Ok(removed)
    }

    /// Records a failed attempt and either schedules a retry or escalates the
    /// entry into the dead letter vault.
    #[instrument(skip(self, error), fields(message_id = %message_id, kind = kind.as_str()))]
    pub async fn mark_failed(
        &self,
        message_id: &MessageId,
        kind: FailureKind,
        error: impl Into<String>,
        now: UnixTimeMs,
    ) -> Result<FailureOutcome, OutboxError> {
        let entry = self.require(message_id).await?;
        if !matches!(entry.status, EntryStatus::Pending | EntryStatus::Sending) {
            return Err(OutboxError::InvalidStateTransition {
                message_id: *message_id,
                from: entry.status,
                to: "FAILED",
            });
        }

        let mut error = error.into();
        truncate_utf8_safe(&mut error, MAX_ERROR_LENGTH);
        let expected = entry.status;

        match self.config.retry.on_failure(entry.retry_count) {
            RetryDecision::Retry { retry_count, .. } => {
                let mut updated = entry;
                updated.status = EntryStatus::Failed;
                updated.retry_count = retry_count;
                updated.last_attempt_at = Some(now);
                updated.last_error = Some(error);
                updated.last_failure = Some(kind);

                if !self
                    .storage
                    .compare_and_swap(message_id, expected, &updated)
                    .await?
                {
                    return Err(OutboxError::ConcurrentModification(*message_id));
                }

                self.metrics.entries_failed.fetch_add(1, Ordering::Relaxed);
                let next_attempt_at = self.config.retry.next_attempt_at(now, retry_count);
                warn!(retry_count, "Entry failed, retry scheduled");
                Ok(FailureOutcome::Retrying {
                    retry_count,
                    next_attempt_at,
                })
            }
            RetryDecision::Escalate { failure_count } => {
                let record = DeadLetterRecord::from_entry(
                    &entry,
                    kind.dead_letter_reason(),
                    failure_count,
                    Some(error),
                    now,
                );

                if !self
                    .storage
                    .escalate_entry(message_id, expected, &record)
                    .await?
                {
                    return Err(OutboxError::ConcurrentModification(*message_id));
                }

                self.metrics.entries_escalated.fetch_add(1, Ordering::Relaxed);
                error!(
                    reason = record.failure_reason.as_str(),
                    failure_count, "Entry escalated to dead letter vault"
                );
                Ok(FailureOutcome::Escalated(record))
            }
        }
    }

    /// Returns SENDING entries left behind by a crash to PENDING without
    /// charging them a retry.
    #[instrument(skip(self))]
    pub async fn recover_in_flight(&self) -> Result<usize, OutboxError> {
        let stuck = self.storage.load_by_status(EntryStatus::Sending, usize::MAX).await?;
        let mut recovered = 0;
        for entry in stuck {
            let mut updated = entry.clone();
            updated.status = EntryStatus::Pending;
            if self
                .storage
                .compare_and_swap(&entry.message_id, EntryStatus::Sending, &updated)
                .await?
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!("Recovered {} in-flight entries", recovered);
        }
        Ok(recovered)
    }

    /// Fails SENDING entries that were not acknowledged within `ack_timeout`.
    #[instrument(skip(self))]
    pub async fn expire_unacknowledged(
        &self,
        now: UnixTimeMs,
        ack_timeout: Duration,
    ) -> Result<Vec<(MessageId, FailureOutcome)>, OutboxError> {
        let timeout_ms = u64::try_from(ack_timeout.as_millis()).unwrap_or(u64::MAX);
        let sending = self.storage.load_by_status(EntryStatus::Sending, usize::MAX).await?;
        let mut outcomes = Vec::new();

        for entry in sending {
            let started = entry.last_attempt_at.unwrap_or(entry.created_at);
            if now < started.add_millis(timeout_ms) {
                continue;
            }
            match self
                .mark_failed(
                    &entry.message_id,
                    FailureKind::TransientTransport,
                    format!("no acknowledgment within {timeout_ms}ms"),
                    now,
                )
                .await
            {
                Ok(outcome) => outcomes.push((entry.message_id, outcome)),
                // Acknowledged or failed by another task in the meantime.
                Err(OutboxError::NotFound(_) | OutboxError::ConcurrentModification(_)) => {}
                Err(OutboxError::InvalidStateTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    /// FAILED -> PENDING for entries whose backoff has elapsed.
    #[instrument(skip(self))]
    pub async fn promote_due(&self, now: UnixTimeMs) -> Result<usize, OutboxError> {
        let failed = self.storage.load_by_status(EntryStatus::Failed, usize::MAX).await?;
        let mut promoted = 0;
        for entry in failed {
            let last = entry.last_attempt_at.unwrap_or(entry.created_at);
            if !self.config.retry.is_due(last, entry.retry_count, now) {
                continue;
            }
            let mut updated = entry.clone();
            updated.status = EntryStatus::Pending;
            if self
                .storage
                .compare_and_swap(&entry.message_id, EntryStatus::Failed, &updated)
                .await?
            {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Entries not yet delivered, including those waiting out a backoff.
    pub async fn active_count(&self) -> Result<usize, OutboxError> {
        Ok(self.storage.count_entries().await?)
    }

    pub async fn sync(&self) -> Result<(), OutboxError> {
        Ok(self.storage.checkpoint().await?)
    }

    async fn require(&self, message_id: &MessageId) -> Result<OutboxEntry, OutboxError> {
        self.storage
            .get_entry(message_id)
            .await?
            .ok_or(OutboxError::NotFound(*message_id))
    }
}

// ============================================================================
// Tests with Failure Injection
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::{DeadLetterReason, DeadLetterStorage};
    use crate::store::SqliteStore;
    use std::sync::atomic::AtomicBool;

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    struct FailableStorage {
        inner: SqliteStore,
        fail_inserts: AtomicBool,
    }

    #[async_trait]
    impl OutboxStorage for FailableStorage {
        async fn insert_entry(&self, entry: &OutboxEntry, max_entries: usize) -> Result<(), StorageError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(StorageError::Database("disk full".into()));
            }
            self.inner.insert_entry(entry, max_entries).await
        }
        async fn get_entry(&self, id: &MessageId) -> Result<Option<OutboxEntry>, StorageError> {
            self.inner.get_entry(id).await
        }
        async fn load_by_status(
            &self,
            status: EntryStatus,
            limit: usize,
        ) -> Result<Vec<OutboxEntry>, StorageError> {
            self.inner.load_by_status(status, limit).await
        }
        async fn compare_and_swap(
            &self,
            id: &MessageId,
            expected: EntryStatus,
            updated: &OutboxEntry,
        ) -> Result<bool, StorageError> {
            self.inner.compare_and_swap(id, expected, updated).await
        }
        async fn remove_entry(&self, id: &MessageId) -> Result<bool, StorageError> {
            self.inner.remove_entry(id).await
        }
        async fn escalate_entry(
            &self,
            id: &MessageId,
            expected: EntryStatus,
            record: &DeadLetterRecord,
        ) -> Result<bool, StorageError> {
            self.inner.escalate_entry(id, expected, record).await
        }
        async fn count_entries(&self) -> Result<usize, StorageError> {
            self.inner.count_entries().await
        }
        async fn checkpoint(&self) -> Result<(), StorageError> {
            self.inner.checkpoint().await
        }
    }

    async fn outbox() -> (Outbox<SqliteStore>, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let outbox = Outbox::new(store.clone(), OutboxConfig::default(), Arc::new(SyncMetrics::new())).unwrap();
        (outbox, store)
    }

    fn entry_at(ms: u64) -> OutboxEntry {
        OutboxEntry::new(MessageType::LineItemAdded, format!(r#"{{"n":{ms}}}"#), 2)
            .with_created_at(UnixTimeMs(ms))
    }

    #[tokio::test]
    async fn enqueue_computes_checksum_and_persists() {
        let (outbox, _) = outbox().await;
        let entry = entry_at(1);
        let stored = outbox.enqueue(entry.clone()).await.unwrap();
        assert_eq!(stored.checksum, checksum::compute(&entry.payload));

        let loaded = outbox.get(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(loaded.status, EntryStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_message_id_rejected() {
        let (outbox, _) = outbox().await;
        let entry = entry_at(1);
        outbox.enqueue(entry.clone()).await.unwrap();
        let again = outbox.enqueue(entry_at(2).with_message_id(entry.message_id)).await;
        assert!(matches!(again, Err(OutboxError::DuplicateMessageId(_))));
        assert_eq!(outbox.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_by_creation_time() {
        let (outbox, _) = outbox().await;
        for ms in [30, 10, 20] {
            let entry = entry_at(ms).with_priority(Priority::new(100 - ms as u8).unwrap());
            outbox.enqueue(entry).await.unwrap();
        }
        let pending = outbox.dequeue_pending(10).await.unwrap();
        let order: Vec<u64> = pending.iter().map(|e| e.created_at.0).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert_eq!(outbox.dequeue_pending(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn storage_failure_surfaces_to_caller() {
        let inner = SqliteStore::open_in_memory().await.unwrap();
        let storage = Arc::new(FailableStorage {
            inner,
            fail_inserts: AtomicBool::new(true),
        });
        let outbox = Outbox::new(storage.clone(), OutboxConfig::default(), Arc::new(SyncMetrics::new())).unwrap();

        let result = outbox.enqueue(entry_at(1)).await;
        assert!(matches!(result, Err(OutboxError::Storage(_))));
        assert_eq!(outbox.active_count().await.unwrap(), 0);

        storage.fail_inserts.store(false, Ordering::SeqCst);
        assert!(outbox.enqueue(entry_at(1)).await.is_ok());
    }

    #[tokio::test]
    async fn capacity_enforced() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let config = OutboxConfig {
            max_entries: 2,
            ..Default::default()
        };
        let outbox = Outbox::new(store, config, Arc::new(SyncMetrics::new())).unwrap();
        outbox.enqueue(entry_at(1)).await.unwrap();
        outbox.enqueue(entry_at(2)).await.unwrap();
        assert!(matches!(outbox.enqueue(entry_at(3)).await, Err(OutboxError::Full(2))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_never_exceed_capacity() {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let config = OutboxConfig {
            max_entries: 3,
            ..Default::default()
        };
        let outbox = Arc::new(Outbox::new(store, config, Arc::new(SyncMetrics::new())).unwrap());

        let handles: Vec<_> = (0..16)
            .map(|ms| {
                let outbox = Arc::clone(&outbox);
                tokio::spawn(async move { outbox.enqueue(entry_at(ms)).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert!(matches!(e, OutboxError::Full(3)), "unexpected {e}"),
            }
        }
        assert_eq!(accepted, 3);
        assert_eq!(outbox.active_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sent_entries_are_deleted() {
        let (outbox, _) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        outbox.mark_sending(&entry.message_id, make_now()).await.unwrap();
        assert!(outbox.mark_sent(&entry.message_id).await.unwrap());
        assert!(!outbox.mark_sent(&entry.message_id).await.unwrap());
        assert!(outbox.get(&entry.message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sending_twice_is_invalid() {
        let (outbox, _) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        outbox.mark_sending(&entry.message_id, make_now()).await.unwrap();
        let again = outbox.mark_sending(&entry.message_id, make_now()).await;
        assert!(matches!(again, Err(OutboxError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn failure_backoff_then_promotion() {
        let (outbox, _) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        let now = make_now();

        outbox.mark_sending(&entry.message_id, now).await.unwrap();
        let outcome = outbox
            .mark_failed(&entry.message_id, FailureKind::TransientTransport, "no peers", now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retrying {
                retry_count: 1,
                next_attempt_at: now.add_millis(100)
            }
        );

        let failed = outbox.get(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("no peers"));
        assert_eq!(failed.last_failure, Some(FailureKind::TransientTransport));

        assert_eq!(outbox.promote_due(now.add_millis(99)).await.unwrap(), 0);
        assert_eq!(outbox.promote_due(now.add_millis(100)).await.unwrap(), 1);
        assert_eq!(outbox.dequeue_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sixth_failure_escalates_exactly_once() {
        let (outbox, store) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        let mut now = make_now();

        for expected in 1..=5 {
            outbox.mark_sending(&entry.message_id, now).await.unwrap();
            let outcome = outbox
                .mark_failed(&entry.message_id, FailureKind::PeerRejected, "bad schema", now)
                .await
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::Retrying { retry_count, .. } if retry_count == expected));
            now = now.add_millis(10_000);
            assert_eq!(outbox.promote_due(now).await.unwrap(), 1);
        }

        let at_ceiling = outbox.get(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(at_ceiling.retry_count, 5);

        outbox.mark_sending(&entry.message_id, now).await.unwrap();
        let outcome = outbox
            .mark_failed(&entry.message_id, FailureKind::PeerRejected, "bad schema", now)
            .await
            .unwrap();

        let FailureOutcome::Escalated(record) = outcome else {
            panic!("expected escalation");
        };
        assert_eq!(record.original_message_id, entry.message_id);
        assert_eq!(record.failure_reason, DeadLetterReason::PeerRejected);
        assert_eq!(record.failure_count, 6);
        assert!(record.requires_review);

        assert!(outbox.get(&entry.message_id).await.unwrap().is_none());
        assert_eq!(store.count_unresolved().await.unwrap(), 1);
        assert_eq!(store.list_unresolved().await.unwrap()[0], record);
    }

    #[tokio::test]
    async fn unacknowledged_sends_time_out() {
        let (outbox, _) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        let now = make_now();
        outbox.mark_sending(&entry.message_id, now).await.unwrap();

        let timeout = Duration::from_secs(10);
        assert!(outbox.expire_unacknowledged(now.add_millis(9_999), timeout).await.unwrap().is_empty());

        let expired = outbox.expire_unacknowledged(now.add_millis(10_000), timeout).await.unwrap();
        assert_eq!(expired.len(), 1);
        let failed = outbox.get(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert_eq!(failed.retry_count, 1);
    }

    #[tokio::test]
    async fn recovery_returns_sending_to_pending_without_charge() {
        let (outbox, _) = outbox().await;
        let entry = outbox.enqueue(entry_at(1)).await.unwrap();
        outbox.mark_sending(&entry.message_id, make_now()).await.unwrap();

        assert_eq!(outbox.recover_in_flight().await.unwrap(), 1);
        let recovered = outbox.get(&entry.message_id).await.unwrap().unwrap();
        assert_eq!(recovered.status, EntryStatus::Pending);
        assert_eq!(recovered.retry_count, 0);
    }

    #[test]
    fn test_utf8_truncation_multi_byte() {
        let mut s = "é".repeat(300);
        truncate_utf8_safe(&mut s, MAX_ERROR_LENGTH);
        assert!(s.len() <= MAX_ERROR_LENGTH);
        assert!(s.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_config_validation() {
        assert!(OutboxConfig::default().validate().is_ok());
        let bad = OutboxConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
