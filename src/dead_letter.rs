//! Quarantine for outbox entries that exhausted automatic retry.
//!
//! Records here are only ever created by escalation and only ever changed by
//! an operator with the authority to resolve them. Nothing is deleted while
//! unresolved.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::model::{HighResTimestamp, MessageId, MessageType, Priority, UnixTimeMs};
use crate::outbox::OutboxEntry;
use crate::store::StorageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    TransientTransportExhausted,
    ChecksumMismatch,
    PeerRejected,
    ConflictUnresolvable,
}

impl DeadLetterReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientTransportExhausted => "TRANSIENT_TRANSPORT_EXHAUSTED",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::PeerRejected => "PEER_REJECTED",
            Self::ConflictUnresolvable => "CONFLICT_UNRESOLVABLE",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT_TRANSPORT_EXHAUSTED" => Some(Self::TransientTransportExhausted),
            "CHECKSUM_MISMATCH" => Some(Self::ChecksumMismatch),
            "PEER_REJECTED" => Some(Self::PeerRejected),
            "CONFLICT_UNRESOLVABLE" => Some(Self::ConflictUnresolvable),
            _ => None,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorRole {
    Staff,
    Supervisor,
    Manager,
}

impl OperatorRole {
    #[must_use]
    pub const fn can_resolve(self) -> bool {
        matches!(self, Self::Supervisor | Self::Manager)
    }

    #[must_use]
    pub const fn can_purge(self) -> bool {
        matches!(self, Self::Manager)
    }
}

/// Authenticated person acting on the vault. Authentication itself happens
/// outside this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: String,
    pub role: OperatorRole,
}

impl Operator {
    pub fn new(id: impl Into<String>, role: OperatorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Give up on the message.
    Discard,
    /// Put the message back in the outbox with a fresh retry budget.
    Requeue,
}

impl ResolutionAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Requeue => "requeue",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discard" => Some(Self::Discard),
            "requeue" => Some(Self::Requeue),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_at: UnixTimeMs,
    pub resolved_by: String,
    pub action: ResolutionAction,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_message_id: MessageId,
    pub message_type: MessageType,
    pub payload: String,
    pub checksum: String,
    pub entity_version: u64,
    pub high_res_timestamp: HighResTimestamp,
    pub priority: Priority,
    pub failure_reason: DeadLetterReason,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub requires_review: bool,
    pub created_at: UnixTimeMs,
    pub resolution: Option<Resolution>,
}

impl DeadLetterRecord {
    /// Mirrors an outbox entry at the moment it escalates.
    #[must_use]
    pub fn from_entry(
        entry: &OutboxEntry,
        reason: DeadLetterReason,
        failure_count: u32,
        last_error: Option<String>,
        now: UnixTimeMs,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_message_id: entry.message_id,
            message_type: entry.message_type,
            payload: entry.payload.clone(),
            checksum: entry.checksum.clone(),
            entity_version: entry.entity_version,
            high_res_timestamp: entry.high_res_timestamp,
            priority: entry.priority,
            failure_reason: reason,
            failure_count,
            last_error,
            requires_review: true,
            created_at: now,
            resolution: None,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Fresh outbox entry carrying the original message id, so receivers that
    /// did apply an earlier copy still deduplicate it.
    #[must_use]
    pub fn to_requeued_entry(&self, now: UnixTimeMs) -> OutboxEntry {
        OutboxEntry {
            message_id: self.original_message_id,
            message_type: self.message_type,
            payload: self.payload.clone(),
            checksum: self.checksum.clone(),
            entity_version: self.entity_version,
            created_at: now,
            high_res_timestamp: self.high_res_timestamp,
            priority: self.priority,
            is_additive: crate::resolver::is_additive(self.message_type),
            retry_count: 0,
            status: crate::outbox::EntryStatus::Pending,
            last_attempt_at: None,
            last_error: None,
            last_failure: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead letter not found: {0}")]
    NotFound(Uuid),

    #[error("dead letter {0} is already resolved")]
    AlreadyResolved(Uuid),

    #[error("operator {operator} may not {action} dead letters")]
    Unauthorized {
        operator: String,
        action: &'static str,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait DeadLetterStorage: Send + Sync {
    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterRecord>, StorageError>;
    async fn list_unresolved(&self) -> Result<Vec<DeadLetterRecord>, StorageError>;
    async fn count_unresolved(&self) -> Result<usize, StorageError>;
    /// Writes the resolution fields and, when `requeue` is given, inserts the
    /// outbox entry in the same transaction. Returns `false` if the record was
    /// missing or already resolved.
    async fn resolve_dead_letter(
        &self,
        id: Uuid,
        resolution: &Resolution,
        requeue: Option<&OutboxEntry>,
    ) -> Result<bool, StorageError>;
    async fn purge_resolved_before(&self, cutoff: UnixTimeMs) -> Result<usize, StorageError>;
}

pub struct DeadLetterVault<S: DeadLetterStorage + ?Sized> {
    storage: Arc<S>,
}

impl<S: DeadLetterStorage + ?Sized> DeadLetterVault<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, id: Uuid) -> Result<DeadLetterRecord, DeadLetterError> {
        self.storage
            .get_dead_letter(id)
            .await?
            .ok_or(DeadLetterError::NotFound(id))
    }

    /// Oldest first.
    pub async fn unresolved(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        Ok(self.storage.list_unresolved().await?)
    }

    pub async fn unresolved_count(&self) -> Result<usize, DeadLetterError> {
        Ok(self.storage.count_unresolved().await?)
    }

    #[instrument(skip(self, operator, notes), fields(operator = %operator.id, action = action.as_str()))]
    pub async fn resolve(
        &self,
        id: Uuid,
        operator: &Operator,
        action: ResolutionAction,
        notes: Option<String>,
    ) -> Result<DeadLetterRecord, DeadLetterError> {
        if !operator.role.can_resolve() {
            warn!("Rejected dead letter resolution by unauthorized operator");
            return Err(DeadLetterError::Unauthorized {
                operator: operator.id.clone(),
                action: "resolve",
            });
        }

        let mut record = self.get(id).await?;
        if record.is_resolved() {
            return Err(DeadLetterError::AlreadyResolved(id));
        }

        let now = UnixTimeMs::now();
        let resolution = Resolution {
            resolved_at: now,
            resolved_by: operator.id.clone(),
            action,
            notes,
        };
        let requeued = match action {
            ResolutionAction::Requeue => Some(record.to_requeued_entry(now)),
            ResolutionAction::Discard => None,
        };

        if !self
            .storage
            .resolve_dead_letter(id, &resolution, requeued.as_ref())
            .await?
        {
            return Err(DeadLetterError::AlreadyResolved(id));
        }

        info!(message_id = %record.original_message_id, "Dead letter resolved");
        record.requires_review = false;
        record.resolution = Some(resolution);
        Ok(record)
    }

    /// Deletes resolved records older than `cutoff`. Unresolved records are
    /// never touched.
    #[instrument(skip(self, operator), fields(operator = %operator.id))]
    pub async fn purge_resolved(
        &self,
        operator: &Operator,
        cutoff: UnixTimeMs,
    ) -> Result<usize, DeadLetterError> {
        if !operator.role.can_purge() {
            return Err(DeadLetterError::Unauthorized {
                operator: operator.id.clone(),
                action: "purge",
            });
        }
        let purged = self.storage.purge_resolved_before(cutoff).await?;
        info!("Purged {} resolved dead letters", purged);
        Ok(purged)
    }
}
