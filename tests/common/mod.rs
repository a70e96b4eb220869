#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use pos_sync::transport::memory::{MemoryNetwork, MemoryTransport};
use pos_sync::{DeviceId, InboundFrame, SqliteStore, SyncConfig, SyncCoordinator, UnixTimeMs};
use tokio::sync::mpsc;

pub type Node = SyncCoordinator<SqliteStore, MemoryTransport>;

pub fn device(name: &str) -> DeviceId {
    DeviceId::new(name).unwrap()
}

pub fn config(name: &str) -> SyncConfig {
    SyncConfig {
        inter_message_delay_ms: 0,
        ..SyncConfig::for_device(device(name))
    }
}

pub async fn node(net: &MemoryNetwork, name: &str) -> (Node, mpsc::Receiver<InboundFrame>) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    attach(net, name, store)
}

pub async fn node_at(
    net: &MemoryNetwork,
    name: &str,
    path: &Path,
) -> (Node, mpsc::Receiver<InboundFrame>) {
    let store = Arc::new(SqliteStore::open(path).await.unwrap());
    attach(net, name, store)
}

fn attach(
    net: &MemoryNetwork,
    name: &str,
    store: Arc<SqliteStore>,
) -> (Node, mpsc::Receiver<InboundFrame>) {
    let (transport, rx) = net.join(device(name));
    let node = SyncCoordinator::new(config(name), store, Arc::new(transport)).unwrap();
    (node, rx)
}

/// Handles every frame already waiting for `node`. Returns how many.
pub async fn pump(node: &Node, rx: &mut mpsc::Receiver<InboundFrame>) -> usize {
    let mut handled = 0;
    while let Ok(frame) = rx.try_recv() {
        node.handle_frame(frame).await.unwrap();
        handled += 1;
    }
    handled
}

/// Drains `from`, lets `to` apply, then lets `from` process the replies.
pub async fn exchange(
    from: &Node,
    from_rx: &mut mpsc::Receiver<InboundFrame>,
    to: &Node,
    to_rx: &mut mpsc::Receiver<InboundFrame>,
    now: UnixTimeMs,
) {
    from.drain_once(now).await.unwrap();
    pump(to, to_rx).await;
    pump(from, from_rx).await;
}
