//! In-process network for tests and single-host demos.
//!
//! Every joined device gets an inbound channel. Links between pairs of
//! devices can be cut and healed to simulate partitions, and an optional
//! interceptor can drop or rewrite frames in flight.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

use super::{InboundFrame, PeerHandle, Transport, TransportError};
use crate::model::DeviceId;

const INBOUND_CAPACITY: usize = 1024;
const DISCOVERY_CAPACITY: usize = 64;

/// Called as `(from, to, bytes)`; `None` drops the frame.
pub type Interceptor = Arc<dyn Fn(&DeviceId, &DeviceId, Bytes) -> Option<Bytes> + Send + Sync>;

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<DeviceId, mpsc::Sender<InboundFrame>>,
    watchers: HashMap<DeviceId, Vec<mpsc::Sender<PeerHandle>>>,
    cut: HashSet<(DeviceId, DeviceId)>,
    interceptor: Option<Interceptor>,
}

impl NetworkState {
    fn link(a: &DeviceId, b: &DeviceId) -> (DeviceId, DeviceId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    fn connected(&self, a: &DeviceId, b: &DeviceId) -> bool {
        a != b
            && self.endpoints.contains_key(a)
            && self.endpoints.contains_key(b)
            && !self.cut.contains(&Self::link(a, b))
    }

    fn peers_of(&self, device: &DeviceId) -> Vec<DeviceId> {
        self.endpoints
            .keys()
            .filter(|other| self.connected(device, other))
            .cloned()
            .collect()
    }

    fn announce(&mut self, to: &DeviceId, peer: &DeviceId) {
        if let Some(watchers) = self.watchers.get_mut(to) {
            watchers.retain(|w| !w.is_closed());
            for w in watchers.iter() {
                // A full discovery channel just misses this announcement.
                let _ = w.try_send(PeerHandle::new(peer.clone()));
            }
        }
    }

    fn announce_pair(&mut self, a: &DeviceId, b: &DeviceId) {
        if self.connected(a, b) {
            self.announce(a, b);
            self.announce(b, a);
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

fn lock(state: &Mutex<NetworkState>) -> MutexGuard<'_, NetworkState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a device and returns its transport plus its inbound frames.
    pub fn join(&self, device_id: DeviceId) -> (MemoryTransport, mpsc::Receiver<InboundFrame>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut state = lock(&self.state);
        state.endpoints.insert(device_id.clone(), tx);
        for peer in state.peers_of(&device_id) {
            state.announce(&peer, &device_id);
        }
        debug!(device = %device_id, "Joined memory network");

        let transport = MemoryTransport {
            local: device_id,
            state: Arc::clone(&self.state),
        };
        (transport, rx)
    }

    pub fn leave(&self, device_id: &DeviceId) {
        let mut state = lock(&self.state);
        state.endpoints.remove(device_id);
        state.watchers.remove(device_id);
    }

    pub fn partition(&self, a: &DeviceId, b: &DeviceId) {
        lock(&self.state).cut.insert(NetworkState::link(a, b));
    }

    pub fn heal(&self, a: &DeviceId, b: &DeviceId) {
        let mut state = lock(&self.state);
        state.cut.remove(&NetworkState::link(a, b));
        state.announce_pair(a, b);
    }

    /// Cuts every link of `device`.
    pub fn isolate(&self, device: &DeviceId) {
        let mut state = lock(&self.state);
        let others: Vec<DeviceId> = state.endpoints.keys().filter(|d| *d != device).cloned().collect();
        for other in others {
            state.cut.insert(NetworkState::link(device, &other));
        }
    }

    pub fn heal_all(&self) {
        let mut state = lock(&self.state);
        let cut: Vec<(DeviceId, DeviceId)> = state.cut.drain().collect();
        for (a, b) in cut {
            state.announce_pair(&a, &b);
        }
    }

    pub fn set_interceptor(&self, interceptor: Option<Interceptor>) {
        lock(&self.state).interceptor = interceptor;
    }
}

pub struct MemoryTransport {
    local: DeviceId,
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.local
    }

    async fn deliver(&self, to: &DeviceId, bytes: Bytes) -> bool {
        let (sender, interceptor) = {
            let state = lock(&self.state);
            if !state.connected(&self.local, to) {
                return false;
            }
            let Some(sender) = state.endpoints.get(to).cloned() else {
                return false;
            };
            (sender, state.interceptor.clone())
        };

        let bytes = match interceptor {
            Some(intercept) => match intercept(&self.local, to, bytes) {
                Some(bytes) => bytes,
                // Lost in flight; the sender cannot tell.
                None => return true,
            },
            None => bytes,
        };

        sender
            .send(InboundFrame {
                peer: PeerHandle::new(self.local.clone()),
                bytes,
            })
            .await
            .is_ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn discover(&self) -> mpsc::Receiver<PeerHandle> {
        let (tx, rx) = mpsc::channel(DISCOVERY_CAPACITY);
        let mut state = lock(&self.state);
        for peer in state.peers_of(&self.local) {
            let _ = tx.try_send(PeerHandle::new(peer));
        }
        state.watchers.entry(self.local.clone()).or_default().push(tx);
        rx
    }

    async fn send(&self, peer: &PeerHandle, bytes: Bytes) -> Result<bool, TransportError> {
        Ok(self.deliver(&peer.device_id, bytes).await)
    }

    async fn broadcast(&self, bytes: Bytes) -> Result<usize, TransportError> {
        let peers = lock(&self.state).peers_of(&self.local);
        let mut reached = 0;
        for peer in peers {
            if self.deliver(&peer, bytes.clone()).await {
                reached += 1;
            }
        }
        Ok(reached)
    }

    fn reachable_peers(&self) -> Vec<PeerHandle> {
        lock(&self.state)
            .peers_of(&self.local)
            .into_iter()
            .map(PeerHandle::new)
            .collect()
    }
}
