//! Persistence seams shared by the sync components.
//!
//! Each component declares the storage trait it needs next to its own logic
//! (`OutboxStorage`, `LedgerStorage`, `DeadLetterStorage`). This module adds
//! the order table and the two operations that span more than one of them:
//! commit a local edit together with its outbox entry, and apply a remote
//! mutation together with its ledger row.

use async_trait::async_trait;
use thiserror::Error;

use crate::dead_letter::DeadLetterStorage;
use crate::ledger::{LedgerStorage, ProcessedMessageRecord};
use crate::model::OrderId;
use crate::order::{ApplyEffect, ApplyError, Order, OrderMutation};
use crate::outbox::{OutboxEntry, OutboxStorage};
use crate::resolver::StatusPrecedence;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("capacity of {0} entries reached")]
    Full(usize),

    /// The row changed between the caller's read and its write.
    #[error("concurrent write to {table} ({key})")]
    Conflict { table: &'static str, key: String },

    #[error("corrupted row in {table} ({key}): {reason}")]
    Corrupted {
        table: &'static str,
        key: String,
        reason: String,
    },

    #[error("connection lock poisoned")]
    LockPoisoned,

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result of [`OrderStore::apply_and_record`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The message id was already in the ledger; nothing was written.
    Duplicate,
    /// Mutation applied and ledger row inserted.
    Applied(ApplyEffect),
    /// Mutation could not be applied; the transaction was rolled back and
    /// the message id stays unrecorded.
    Rejected(ApplyError),
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn load_order(&self, order_id: &OrderId) -> Result<Option<Order>, StorageError>;
    async fn list_orders(&self) -> Result<Vec<Order>, StorageError>;

    /// Writes a locally edited order and its outbox entry in one transaction.
    ///
    /// `previous` is the copy the edit started from (`None` for a new order).
    /// If the stored row no longer matches it, nothing is written and
    /// [`StorageError::Conflict`] is returned. The outbox capacity check runs
    /// inside the same transaction and fails with [`StorageError::Full`].
    async fn commit_local(
        &self,
        previous: Option<&Order>,
        order: &Order,
        entry: &OutboxEntry,
        max_entries: usize,
    ) -> Result<(), StorageError>;

    /// Ledger check, order load, resolution, order write and ledger insert as
    /// a single transaction.
    async fn apply_and_record(
        &self,
        mutation: &OrderMutation,
        record: &ProcessedMessageRecord,
        precedence: StatusPrecedence,
    ) -> Result<ApplyOutcome, StorageError>;
}

/// Everything the coordinator persists, behind one handle.
pub trait SyncStore: OutboxStorage + LedgerStorage + DeadLetterStorage + OrderStore {}

impl<T> SyncStore for T where T: OutboxStorage + LedgerStorage + DeadLetterStorage + OrderStore {}
