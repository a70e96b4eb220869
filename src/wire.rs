//! Frames exchanged between devices. JSON, camelCase.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{self, ChecksumError};
use crate::model::{DeviceId, MessageId, MessageType, ValidationError};
use crate::outbox::OutboxEntry;
use crate::retry::FailureKind;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("batch checksum: {0}")]
    BatchChecksum(#[from] ChecksumError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub message_id: MessageId,
    pub sender_id: DeviceId,
    /// Kept as a string so a frame with a type this build does not know
    /// still decodes and can be rejected by id.
    pub message_type: String,
    pub payload: String,
    pub version: u64,
    pub checksum: String,
}

impl WireMessage {
    #[must_use]
    pub fn from_entry(entry: &OutboxEntry, sender_id: &DeviceId) -> Self {
        Self {
            message_id: entry.message_id,
            sender_id: sender_id.clone(),
            message_type: entry.message_type.as_str().to_string(),
            payload: entry.payload.clone(),
            version: entry.entity_version,
            checksum: entry.checksum.clone(),
        }
    }

    pub fn parsed_type(&self) -> Result<MessageType, ValidationError> {
        MessageType::parse(&self.message_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    Message(WireMessage),
    #[serde(rename_all = "camelCase")]
    Batch {
        messages: Vec<WireMessage>,
        batch_checksum: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        message_id: MessageId,
        receiver_id: DeviceId,
    },
    #[serde(rename_all = "camelCase")]
    Nack {
        message_id: MessageId,
        receiver_id: DeviceId,
        reason: FailureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl Frame {
    /// Wraps several messages with a checksum over their payloads.
    #[must_use]
    pub fn batch(messages: Vec<WireMessage>) -> Self {
        let batch_checksum = checksum::compute_batch(messages.iter().map(|m| m.payload.as_str()));
        Self::Batch {
            messages,
            batch_checksum,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| WireError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(bytes).map_err(|e| WireError::Decode(e.to_string()))
    }
}

/// Checks a batch checksum against the payloads it claims to cover.
pub fn verify_batch(messages: &[WireMessage], batch_checksum: &str) -> Result<(), WireError> {
    checksum::verify_batch(messages.iter().map(|m| m.payload.as_str()), batch_checksum)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(payload: &str) -> WireMessage {
        let mut entry = OutboxEntry::new(MessageType::StatusChanged, payload, 4);
        entry.checksum = checksum::compute(payload);
        WireMessage::from_entry(&entry, &DeviceId::new("till-1").unwrap())
    }

    #[test]
    fn message_frame_uses_camel_case_fields() {
        let frame = Frame::Message(message(r#"{"status":"VOID"}"#));
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["frame"], "MESSAGE");
        assert_eq!(json["messageType"], "STATUS_CHANGED");
        assert_eq!(json["senderId"], "till-1");
        assert_eq!(json["version"], 4);
        assert!(json.get("messageId").is_some());
    }

    #[test]
    fn unknown_message_type_still_decodes() {
        let mut m = message("{}");
        m.message_type = "TABLE_MERGED".into();
        let decoded = Frame::decode(&Frame::Message(m).encode().unwrap()).unwrap();
        let Frame::Message(m) = decoded else {
            panic!("expected message frame");
        };
        assert!(m.parsed_type().is_err());
    }

    #[test]
    fn nack_carries_reason() {
        let frame = Frame::Nack {
            message_id: MessageId::generate(),
            receiver_id: DeviceId::new("till-2").unwrap(),
            reason: FailureKind::ChecksumMismatch,
            detail: None,
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["reason"], "CHECKSUM_MISMATCH");
        assert!(json.get("detail").is_none());
        assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap(), frame);
    }

    #[test]
    fn batch_checksum_detects_tampering() {
        let Frame::Batch {
            mut messages,
            batch_checksum,
        } = Frame::batch(vec![message("a"), message("b")])
        else {
            panic!("expected batch");
        };
        assert!(verify_batch(&messages, &batch_checksum).is_ok());

        messages.swap(0, 1);
        assert!(verify_batch(&messages, &batch_checksum).is_err());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(Frame::decode(b"\x00\x01"), Err(WireError::Decode(_))));
    }
}
