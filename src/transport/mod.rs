//! Byte-level contract with whatever carries frames between devices.
//!
//! The core never learns how peers are found or reached. A transport hands
//! out peer announcements, moves opaque bytes, and delivers inbound frames on
//! a channel owned by the host.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::DeviceId;

pub mod memory;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub device_id: DeviceId,
}

impl PeerHandle {
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self { device_id }
    }
}

/// Raw bytes received from a peer.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub peer: PeerHandle,
    pub bytes: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport i/o: {0}")]
    Io(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Announces peers as they become reachable.
    async fn discover(&self) -> mpsc::Receiver<PeerHandle>;

    /// Returns `false` when the peer is not reachable right now.
    async fn send(&self, peer: &PeerHandle, bytes: Bytes) -> Result<bool, TransportError>;

    /// Number of peers the bytes reached.
    async fn broadcast(&self, bytes: Bytes) -> Result<usize, TransportError>;

    fn reachable_peers(&self) -> Vec<PeerHandle>;
}
