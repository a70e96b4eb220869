//! Durable record of every inbound message this device has applied.
//!
//! A message id present here is never applied again. Lookups go through a
//! small LRU cache first; the database row is the source of truth.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::metrics::SyncMetrics;
use crate::model::{DeviceId, MessageId, MessageType, UnixTimeMs};
use crate::store::StorageError;

const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMessageRecord {
    pub message_id: MessageId,
    pub message_type: MessageType,
    pub sender_id: DeviceId,
    pub processed_at: UnixTimeMs,
    pub checksum: String,
    /// blake3 of the payload as applied, for audits.
    pub payload_hash: String,
}

impl ProcessedMessageRecord {
    pub fn new(
        message_id: MessageId,
        message_type: MessageType,
        sender_id: DeviceId,
        checksum: impl Into<String>,
        payload: &str,
        processed_at: UnixTimeMs,
    ) -> Self {
        Self {
            message_id,
            message_type,
            sender_id,
            processed_at,
            checksum: checksum.into(),
            payload_hash: blake3::hash(payload.as_bytes()).to_hex().to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait LedgerStorage: Send + Sync {
    async fn is_message_processed(&self, message_id: &MessageId) -> Result<bool, StorageError>;
    async fn get_processed(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ProcessedMessageRecord>, StorageError>;
    /// Returns `false` if a record with this message id already existed.
    async fn insert_processed(&self, record: &ProcessedMessageRecord) -> Result<bool, StorageError>;
    async fn delete_processed_before(&self, cutoff: UnixTimeMs) -> Result<usize, StorageError>;
    async fn count_processed(&self) -> Result<usize, StorageError>;
}

pub struct IdempotencyLedger<S: LedgerStorage + ?Sized> {
    storage: Arc<S>,
    recent: Mutex<lru::LruCache<MessageId, UnixTimeMs>>,
    retention: Duration,
    metrics: Arc<SyncMetrics>,
}

impl<S: LedgerStorage + ?Sized> IdempotencyLedger<S> {
    pub fn new(
        storage: Arc<S>,
        cache_size: usize,
        retention: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(cache_size)
            .or_else(|| NonZeroUsize::new(DEFAULT_CACHE_SIZE))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            storage,
            recent: Mutex::new(lru::LruCache::new(cache_size)),
            retention,
            metrics,
        }
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub async fn is_processed(&self, message_id: &MessageId) -> Result<bool, LedgerError> {
        if self.recent.lock().await.get(message_id).is_some() {
            return Ok(true);
        }
        let processed = self.storage.is_message_processed(message_id).await?;
        if processed {
            debug!(message_id = %message_id, "Ledger hit from storage");
        }
        Ok(processed)
    }

    pub async fn get(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ProcessedMessageRecord>, LedgerError> {
        Ok(self.storage.get_processed(message_id).await?)
    }

    /// Inserts the record unless the id is already known. Returns whether a
    /// new row was written.
    #[instrument(skip(self, record), fields(message_id = %record.message_id))]
    pub async fn record_processed(&self, record: &ProcessedMessageRecord) -> Result<bool, LedgerError> {
        let inserted = self.storage.insert_processed(record).await?;
        if !inserted {
            self.metrics.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.remember(record.message_id, record.processed_at).await;
        Ok(inserted)
    }

    /// Updates the cache after a record was written through another path,
    /// such as the combined apply-and-record transaction.
    pub async fn remember(&self, message_id: MessageId, processed_at: UnixTimeMs) {
        self.recent.lock().await.put(message_id, processed_at);
    }

    /// Drops records older than the retention window.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, now: UnixTimeMs) -> Result<usize, LedgerError> {
        let retention_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now.saturating_sub_millis(retention_ms);

        let removed = self.storage.delete_processed_before(cutoff).await?;

        let mut recent = self.recent.lock().await;
        let expired: Vec<MessageId> = recent
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            recent.pop(id);
        }

        if removed > 0 {
            info!("Ledger cleanup removed {} records", removed);
        }
        Ok(removed)
    }

    pub async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.storage.count_processed().await?)
    }
}
