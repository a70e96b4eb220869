use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("priority must be between 0 and 100, got {0}")]
    PriorityOutOfRange(u8),
}

// ============================================================================
// Identifiers
// ============================================================================

/// Transport-level message identifier. Retries reuse it, which is what makes
/// the receiver's ledger work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| ValidationError::InvalidId(format!("message id {s:?}: {e}")))
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

macro_rules! typed_id {
    ($name:ident, $label:literal) => {
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            const MAX_LENGTH: usize = 128;

            pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
                let id = id.into().trim().to_string();
                if id.is_empty() {
                    return Err(ValidationError::InvalidId(concat!($label, " cannot be empty").into()));
                }
                if id.len() > Self::MAX_LENGTH {
                    return Err(ValidationError::InvalidId(format!(
                        "{} exceeds {} characters",
                        $label,
                        Self::MAX_LENGTH
                    )));
                }
                if id.chars().any(char::is_control) {
                    return Err(ValidationError::InvalidId(concat!(
                        $label,
                        " contains control characters"
                    )
                    .into()));
                }
                Ok(Self(id))
            }

            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(DeviceId, "device id");
typed_id!(OrderId, "order id");
typed_id!(ItemId, "item id");

// ============================================================================
// Time
// ============================================================================

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        )
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    #[must_use]
    pub const fn saturating_sub_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }
}

static LAST_HIGH_RES: AtomicU64 = AtomicU64::new(0);

/// Nanosecond wall-clock timestamp used to break version ties.
///
/// `now()` never returns the same value twice within a process, so two local
/// mutations issued in the same millisecond still order deterministically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HighResTimestamp(pub u64);

impl HighResTimestamp {
    #[must_use]
    pub fn now() -> Self {
        let wall = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();

        let mut last = LAST_HIGH_RES.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last.saturating_add(1));
            match LAST_HIGH_RES.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(observed) => last = observed,
            }
        }
    }

    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Message types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    OrderCreated,
    LineItemAdded,
    ItemClaimed,
    OrderUpdated,
    StatusChanged,
}

impl MessageType {
    pub const ALL: [Self; 5] = [
        Self::OrderCreated,
        Self::LineItemAdded,
        Self::ItemClaimed,
        Self::OrderUpdated,
        Self::StatusChanged,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::LineItemAdded => "LINE_ITEM_ADDED",
            Self::ItemClaimed => "ITEM_CLAIMED",
            Self::OrderUpdated => "ORDER_UPDATED",
            Self::StatusChanged => "STATUS_CHANGED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::UnknownMessageType(s.to_string()))
    }

    /// Priority recorded on outbox entries of this type.
    #[must_use]
    pub const fn default_priority(self) -> u8 {
        match self {
            Self::StatusChanged => 80,
            Self::OrderCreated => 60,
            Self::LineItemAdded | Self::ItemClaimed => 50,
            Self::OrderUpdated => 40,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Order status
// ============================================================================

/// Order lifecycle status. Values the tablet does not recognise are kept
/// verbatim so they round-trip through resolution unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    Pending,
    InProgress,
    Ready,
    Completed,
    Paid,
    Void,
    Other(String),
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
            Self::Paid => "PAID",
            Self::Void => "VOID",
            Self::Other(s) => s.as_str(),
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Self::Pending,
            "IN_PROGRESS" => Self::InProgress,
            "READY" => Self::Ready,
            "COMPLETED" => Self::Completed,
            "PAID" => Self::Paid,
            "VOID" => Self::Void,
            _ => Self::Other(s.to_string()),
        }
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl From<String> for OrderStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<OrderStatus> for String {
    fn from(value: OrderStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated outbox priority (0-100)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 100;

    pub fn new(value: u8) -> Result<Self, ValidationError> {
        if value > Self::MAX {
            return Err(ValidationError::PriorityOutOfRange(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

impl From<MessageType> for Priority {
    fn from(value: MessageType) -> Self {
        Self(value.default_priority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_trims_and_validates() {
        assert_eq!(DeviceId::new("  till-1 ").unwrap().as_str(), "till-1");
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("a\u{0}b").is_err());
        assert!(DeviceId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn message_id_parses_uuid_strings() {
        let id = MessageId::generate();
        assert_eq!(MessageId::parse(&id.to_string()).unwrap(), id);
        assert!(MessageId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn high_res_timestamps_strictly_increase() {
        let mut prev = HighResTimestamp::now();
        for _ in 0..1_000 {
            let next = HighResTimestamp::now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn message_type_wire_names() {
        for t in MessageType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(MessageType::parse(t.as_str()).unwrap(), t);
        }
        assert!(MessageType::parse("TABLE_MOVED").is_err());
    }

    #[test]
    fn order_status_round_trips_unknown_values() {
        assert_eq!(OrderStatus::parse("void"), OrderStatus::Void);
        assert_eq!(OrderStatus::parse("in-progress"), OrderStatus::InProgress);
        let odd = OrderStatus::parse("ON_HOLD");
        assert_eq!(odd, OrderStatus::Other("ON_HOLD".into()));
        let json = serde_json::to_string(&odd).unwrap();
        assert_eq!(serde_json::from_str::<OrderStatus>(&json).unwrap(), odd);
    }

    #[test]
    fn priority_range() {
        assert!(Priority::new(100).is_ok());
        assert!(matches!(Priority::new(101), Err(ValidationError::PriorityOutOfRange(101))));
    }
}
