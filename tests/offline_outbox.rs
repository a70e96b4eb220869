mod common;

use common::{device, node, node_at, pump};
use pos_sync::transport::memory::MemoryNetwork;
use pos_sync::{EntryStatus, LineItem, OrderStatus, UnixTimeMs};
use tempfile::TempDir;

#[tokio::test]
async fn full_offline_to_online_flow() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("till-a.db");
    let net = MemoryNetwork::new();

    let (b, mut b_rx) = node(&net, "till-b").await;

    // 1. Offline: local writes succeed and queue up.
    let (a, _a_rx) = node_at(&net, "till-a", &db).await;
    net.isolate(&device("till-a"));

    let order = a.create_order(Some("T12".into())).await.unwrap();
    a.add_line_item(&order.order_id, LineItem::new("Burger", 2, 1150))
        .await
        .unwrap();

    let report = a.drain_once(UnixTimeMs::now()).await.unwrap();
    assert!(report.offline);
    assert_eq!(a.status().await.unwrap().pending_outbound, 2);

    // 2. Reconnect and transmit, but crash before any ACK arrives.
    net.heal_all();
    let report = a.drain_once(UnixTimeMs::now()).await.unwrap();
    assert_eq!(report.messages_sent, 2);
    drop(a);

    // B applies both; its ACKs go nowhere.
    assert_eq!(pump(&b, &mut b_rx).await, 2);
    assert_eq!(b.metrics().snapshot().mutations_applied, 2);

    // 3. Restart from the same file. In-flight entries come back as PENDING.
    let (a, mut a_rx) = node_at(&net, "till-a", &db).await;
    let recovered = a.outbox().recover_in_flight().await.unwrap();
    assert_eq!(recovered, 2);
    let pending = a.outbox().dequeue_pending(10).await.unwrap();
    assert!(pending.iter().all(|e| e.status == EntryStatus::Pending && e.retry_count == 0));

    let restored = a.order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(restored.line_items.len(), 1);

    // 4. Redelivery is acknowledged but not applied again.
    a.drain_once(UnixTimeMs::now()).await.unwrap();
    assert_eq!(pump(&b, &mut b_rx).await, 2);
    assert_eq!(pump(&a, &mut a_rx).await, 2);

    let b_metrics = b.metrics().snapshot();
    assert_eq!(b_metrics.mutations_applied, 2);
    assert_eq!(b_metrics.duplicates_dropped, 2);
    assert_eq!(a.status().await.unwrap().pending_outbound, 0);

    let on_a = a.order(&order.order_id).await.unwrap().unwrap();
    let on_b = b.order(&order.order_id).await.unwrap().unwrap();
    assert_eq!(on_a, on_b);
    assert_eq!(on_b.status, OrderStatus::Pending);
    assert_eq!(on_b.total_cents(), 2300);
}

#[tokio::test]
async fn unacknowledged_send_times_out_and_retries() {
    let net = MemoryNetwork::new();
    let (a, mut a_rx) = node(&net, "till-a").await;
    let (b, mut b_rx) = node(&net, "till-b").await;

    a.create_order(None).await.unwrap();

    let t0 = UnixTimeMs::now();
    a.drain_once(t0).await.unwrap();
    // Frame lost: B never sees it.
    while b_rx.try_recv().is_ok() {}

    let report = a.drain_once(t0.add_millis(9_999)).await.unwrap();
    assert_eq!(report.expired, 0);

    let t1 = t0.add_millis(10_000);
    let report = a.drain_once(t1).await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.retries_scheduled, 1);
    assert_eq!(report.messages_sent, 0);

    let report = a.drain_once(t1.add_millis(100)).await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(report.messages_sent, 1);

    pump(&b, &mut b_rx).await;
    pump(&a, &mut a_rx).await;
    assert_eq!(a.status().await.unwrap().pending_outbound, 0);
    assert_eq!(b.orders().await.unwrap().len(), 1);
}
