//! Order aggregate and the mutations devices exchange about it.
//!
//! Every `apply` is re-apply-safe: feeding the same mutation twice leaves the
//! order exactly as the first application did, so a crash between "applied"
//! and "recorded" costs nothing but a redundant pass.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::model::{HighResTimestamp, ItemId, MessageType, OrderId, OrderStatus};
use crate::resolver::{self, StatusPrecedence, VersionedState};
use crate::retry::FailureKind;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("order {0} is not known on this device yet")]
    MissingOrder(OrderId),

    #[error("item {item_id} of order {order_id} is not known on this device yet")]
    MissingItem { order_id: OrderId, item_id: ItemId },

    #[error("undecodable {message_type} payload: {reason}")]
    Payload {
        message_type: MessageType,
        reason: String,
    },
}

impl ApplyError {
    /// Missing entities are an ordering gap that a later retry can close;
    /// an undecodable payload never will.
    #[must_use]
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::MissingOrder(_) | Self::MissingItem { .. } => FailureKind::ConflictUnresolvable,
            Self::Payload { .. } => FailureKind::PeerRejected,
        }
    }
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub item_id: ItemId,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    #[serde(default)]
    pub claims: BTreeSet<String>,
}

impl LineItem {
    #[must_use]
    pub fn new(name: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            item_id: ItemId::generate(),
            name: name.into(),
            quantity,
            unit_price_cents,
            claims: BTreeSet::new(),
        }
    }

    fn absorb_claims(&mut self, other: &LineItem) {
        self.claims.extend(other.claims.iter().cloned());
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: OrderId,
    pub table_id: Option<String>,
    pub note: Option<String>,
    pub status: OrderStatus,
    pub version: u64,
    pub updated_at: HighResTimestamp,
    #[serde(default)]
    pub line_items: BTreeMap<ItemId, LineItem>,
}

impl Order {
    #[must_use]
    pub fn new(table_id: Option<String>) -> Self {
        Self {
            order_id: OrderId::generate(),
            table_id,
            note: None,
            status: OrderStatus::Pending,
            version: 1,
            updated_at: HighResTimestamp::now(),
            line_items: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> VersionedState {
        VersionedState {
            version: self.version,
            timestamp: self.updated_at,
            status: self.status.clone(),
        }
    }

    #[must_use]
    pub fn total_cents(&self) -> i64 {
        self.line_items
            .values()
            .map(|i| i.unit_price_cents.saturating_mul(i64::from(i.quantity)))
            .sum()
    }

    /// Equality of business content, ignoring version and timestamp.
    #[must_use]
    pub fn same_content(&self, other: &Order) -> bool {
        self.order_id == other.order_id
            && self.table_id == other.table_id
            && self.note == other.note
            && self.status == other.status
            && self.line_items == other.line_items
    }

    fn touch(&mut self) {
        self.version = self.version.saturating_add(1);
        self.updated_at = HighResTimestamp::now().max(self.updated_at);
    }

    // --- Local mutations: change this copy and describe the change ---

    #[must_use]
    pub fn created(&self) -> OrderMutation {
        OrderMutation::Created(self.clone())
    }

    pub fn add_line_item(&mut self, item: LineItem) -> OrderMutation {
        self.line_items.insert(item.item_id.clone(), item.clone());
        self.touch();
        OrderMutation::LineItemAdded(LineItemAdded {
            order_id: self.order_id.clone(),
            item,
            version: self.version,
            timestamp: self.updated_at,
        })
    }

    pub fn claim_item(
        &mut self,
        item_id: &ItemId,
        claimed_by: impl Into<String>,
    ) -> Result<OrderMutation, ApplyError> {
        let claimed_by = claimed_by.into();
        let item = self
            .line_items
            .get_mut(item_id)
            .ok_or_else(|| ApplyError::MissingItem {
                order_id: self.order_id.clone(),
                item_id: item_id.clone(),
            })?;
        item.claims.insert(claimed_by.clone());
        self.touch();
        Ok(OrderMutation::ItemClaimed(ItemClaimed {
            order_id: self.order_id.clone(),
            item_id: item_id.clone(),
            claimed_by,
            version: self.version,
            timestamp: self.updated_at,
        }))
    }

    pub fn update_details(&mut self, table_id: Option<String>, note: Option<String>) -> OrderMutation {
        self.table_id = table_id;
        self.note = note;
        self.touch();
        OrderMutation::Updated(OrderUpdated {
            order_id: self.order_id.clone(),
            table_id: self.table_id.clone(),
            note: self.note.clone(),
            status: self.status.clone(),
            version: self.version,
            timestamp: self.updated_at,
        })
    }

    pub fn set_status(&mut self, status: OrderStatus) -> OrderMutation {
        self.status = status;
        self.touch();
        OrderMutation::StatusChanged(StatusChanged {
            order_id: self.order_id.clone(),
            status: self.status.clone(),
            version: self.version,
            timestamp: self.updated_at,
        })
    }
}

// ============================================================================
// Mutations (wire payloads)
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemAdded {
    pub order_id: OrderId,
    pub item: LineItem,
    pub version: u64,
    pub timestamp: HighResTimestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemClaimed {
    pub order_id: OrderId,
    pub item_id: ItemId,
    pub claimed_by: String,
    pub version: u64,
    pub timestamp: HighResTimestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdated {
    pub order_id: OrderId,
    pub table_id: Option<String>,
    pub note: Option<String>,
    pub status: OrderStatus,
    pub version: u64,
    pub timestamp: HighResTimestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanged {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub version: u64,
    pub timestamp: HighResTimestamp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrderMutation {
    Created(Order),
    LineItemAdded(LineItemAdded),
    ItemClaimed(ItemClaimed),
    Updated(OrderUpdated),
    StatusChanged(StatusChanged),
}

/// What applying a mutation did to the stored order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyEffect {
    Unchanged,
    Upserted(Order),
}

impl OrderMutation {
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Created(_) => MessageType::OrderCreated,
            Self::LineItemAdded(_) => MessageType::LineItemAdded,
            Self::ItemClaimed(_) => MessageType::ItemClaimed,
            Self::Updated(_) => MessageType::OrderUpdated,
            Self::StatusChanged(_) => MessageType::StatusChanged,
        }
    }

    #[must_use]
    pub fn order_id(&self) -> &OrderId {
        match self {
            Self::Created(o) => &o.order_id,
            Self::LineItemAdded(m) => &m.order_id,
            Self::ItemClaimed(m) => &m.order_id,
            Self::Updated(m) => &m.order_id,
            Self::StatusChanged(m) => &m.order_id,
        }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Self::Created(o) => o.version,
            Self::LineItemAdded(m) => m.version,
            Self::ItemClaimed(m) => m.version,
            Self::Updated(m) => m.version,
            Self::StatusChanged(m) => m.version,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> HighResTimestamp {
        match self {
            Self::Created(o) => o.updated_at,
            Self::LineItemAdded(m) => m.timestamp,
            Self::ItemClaimed(m) => m.timestamp,
            Self::Updated(m) => m.timestamp,
            Self::StatusChanged(m) => m.timestamp,
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Created(o) => serde_json::to_string(o),
            Self::LineItemAdded(m) => serde_json::to_string(m),
            Self::ItemClaimed(m) => serde_json::to_string(m),
            Self::Updated(m) => serde_json::to_string(m),
            Self::StatusChanged(m) => serde_json::to_string(m),
        }
    }

    pub fn from_payload(message_type: MessageType, payload: &str) -> Result<Self, ApplyError> {
        let decoded = match message_type {
            MessageType::OrderCreated => serde_json::from_str(payload).map(Self::Created),
            MessageType::LineItemAdded => serde_json::from_str(payload).map(Self::LineItemAdded),
            MessageType::ItemClaimed => serde_json::from_str(payload).map(Self::ItemClaimed),
            MessageType::OrderUpdated => serde_json::from_str(payload).map(Self::Updated),
            MessageType::StatusChanged => serde_json::from_str(payload).map(Self::StatusChanged),
        };
        decoded.map_err(|e| ApplyError::Payload {
            message_type,
            reason: e.to_string(),
        })
    }

    /// Resolves this remote mutation against the current local copy.
    pub fn apply(
        &self,
        local: Option<&Order>,
        precedence: StatusPrecedence,
    ) -> Result<ApplyEffect, ApplyError> {
        let Some(local) = local else {
            return match self {
                Self::Created(remote) => Ok(ApplyEffect::Upserted(remote.clone())),
                other => Err(ApplyError::MissingOrder(other.order_id().clone())),
            };
        };

        let (remote_view, mut candidate) = match self {
            Self::Created(remote) => {
                let mut candidate = if resolver::resolve_version(
                    local.version,
                    remote.version,
                    local.updated_at,
                    remote.updated_at,
                ) {
                    remote.clone()
                } else {
                    local.clone()
                };
                candidate.line_items = union_items(&local.line_items, &remote.line_items);
                let merged = resolver::merge_additive(&local.state(), &remote.state());
                candidate.status = merged.status;
                (remote.clone(), candidate)
            }
            Self::LineItemAdded(m) => {
                let mut remote_view = local.clone();
                remote_view.line_items.insert(m.item.item_id.clone(), m.item.clone());
                let mut candidate = local.clone();
                candidate
                    .line_items
                    .entry(m.item.item_id.clone())
                    .and_modify(|existing| existing.absorb_claims(&m.item))
                    .or_insert_with(|| m.item.clone());
                (remote_view, candidate)
            }
            Self::ItemClaimed(m) => {
                let mut candidate = local.clone();
                let item = candidate
                    .line_items
                    .get_mut(&m.item_id)
                    .ok_or_else(|| ApplyError::MissingItem {
                        order_id: m.order_id.clone(),
                        item_id: m.item_id.clone(),
                    })?;
                item.claims.insert(m.claimed_by.clone());
                (candidate.clone(), candidate)
            }
            Self::Updated(m) => {
                let remote_state = VersionedState {
                    version: m.version,
                    timestamp: m.timestamp,
                    status: m.status.clone(),
                };
                let resolution = resolver::resolve_update(&local.state(), &remote_state, precedence);
                let mut remote_view = local.clone();
                remote_view.table_id = m.table_id.clone();
                remote_view.note = m.note.clone();
                remote_view.status = m.status.clone();

                let mut candidate = local.clone();
                if resolution.accept_remote_fields {
                    candidate.table_id = m.table_id.clone();
                    candidate.note = m.note.clone();
                }
                candidate.status = resolution.status;
                (remote_view, candidate)
            }
            Self::StatusChanged(m) => {
                let remote_state = VersionedState {
                    version: m.version,
                    timestamp: m.timestamp,
                    status: m.status.clone(),
                };
                let resolution = resolver::resolve_update(&local.state(), &remote_state, precedence);
                let mut remote_view = local.clone();
                remote_view.status = m.status.clone();
                let mut candidate = local.clone();
                candidate.status = resolution.status;
                (remote_view, candidate)
            }
        };

        let remote_version = self.version();
        let Some(version) = next_version(local, &remote_view, &candidate, remote_version) else {
            return Ok(ApplyEffect::Unchanged);
        };

        candidate.order_id = local.order_id.clone();
        candidate.version = version;
        candidate.updated_at = local.updated_at.max(self.timestamp());
        if candidate == *local {
            return Ok(ApplyEffect::Unchanged);
        }
        Ok(ApplyEffect::Upserted(candidate))
    }
}

/// Version assigned after resolution, or `None` when nothing changes.
///
/// A remote copy that strictly dominates is fast-forwarded to its own
/// version; any genuine merge lands on `max + 1` so both sides of a
/// concurrent edit arrive at the same number.
fn next_version(local: &Order, remote_view: &Order, candidate: &Order, remote_version: u64) -> Option<u64> {
    let merged = local.version.max(remote_version).saturating_add(1);
    match remote_version.cmp(&local.version) {
        std::cmp::Ordering::Greater => {
            if candidate.same_content(remote_view) {
                Some(remote_version)
            } else {
                Some(merged)
            }
        }
        std::cmp::Ordering::Less => {
            if candidate.same_content(local) {
                None
            } else {
                Some(merged)
            }
        }
        std::cmp::Ordering::Equal => {
            if local.same_content(remote_view) && candidate.same_content(local) {
                None
            } else {
                Some(merged)
            }
        }
    }
}

fn union_items(
    local: &BTreeMap<ItemId, LineItem>,
    remote: &BTreeMap<ItemId, LineItem>,
) -> BTreeMap<ItemId, LineItem> {
    let mut merged = local.clone();
    for (id, item) in remote {
        merged
            .entry(id.clone())
            .and_modify(|existing| existing.absorb_claims(item))
            .or_insert_with(|| item.clone());
    }
    merged
}
