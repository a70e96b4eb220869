// lib.rs - offline-first synchronization core for point-of-sale devices

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod order;
pub mod outbox;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod transport;
pub mod wire;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{ConfigError, SyncConfig};
pub use coordinator::{DrainReport, InboundOutcome, SyncCoordinator};
pub use dead_letter::{
    DeadLetterError, DeadLetterReason, DeadLetterRecord, DeadLetterVault, Operator, OperatorRole,
    ResolutionAction,
};
pub use ledger::{IdempotencyLedger, LedgerError, ProcessedMessageRecord};
pub use metrics::{MetricsSnapshot, SyncMetrics, SyncStatus};
pub use model::{
    DeviceId, HighResTimestamp, ItemId, MessageId, MessageType, OrderId, OrderStatus, Priority,
    UnixTimeMs, ValidationError,
};
pub use order::{ApplyError, LineItem, Order, OrderMutation};
pub use outbox::{EntryStatus, FailureOutcome, Outbox, OutboxEntry, OutboxError};
pub use resolver::StatusPrecedence;
pub use retry::{FailureKind, RetryPolicy};
pub use store::{StorageError, SyncStore};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use transport::{InboundFrame, PeerHandle, Transport, TransportError};
pub use wire::{Frame, WireError, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Retrying later may succeed.
    Transient,
    /// The request itself is wrong; retrying will not help.
    Permanent,
    /// Local state could not be persisted.
    Fatal,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl SyncError {
    #[must_use]
    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Storage(StorageError::Conflict { .. }) => ErrorSeverity::Transient,

            Self::Storage(_)
            | Self::Ledger(_)
            | Self::Outbox(OutboxError::Storage(_))
            | Self::DeadLetter(DeadLetterError::Storage(_)) => ErrorSeverity::Fatal,

            Self::Transport(_) | Self::Outbox(OutboxError::ConcurrentModification(_)) => {
                ErrorSeverity::Transient
            }

            Self::Config(_)
            | Self::Outbox(_)
            | Self::DeadLetter(_)
            | Self::Wire(_)
            | Self::Apply(_)
            | Self::Validation(_)
            | Self::OrderNotFound(_)
            | Self::Serialization(_) => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.severity(), ErrorSeverity::Transient)
    }
}
