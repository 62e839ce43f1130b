// ABOUTME: Tests for the live feed broadcaster, subscriptions, and the sink forwarder.
// ABOUTME: Covers the connected greeting, ordering, lag accounting, and reconnect after failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use super::broadcaster::Broadcaster;
use super::sink::{EventSink, spawn_forwarder};
use super::types::{LiveMessage, LockEvent, LockEventDetails, ReleaseNotice};
use crate::lock::{ActiveLock, LockId};

fn notice(resource: &str) -> LiveMessage {
    LiveMessage::LockReleased(ReleaseNotice {
        lock_id: LockId::new(),
        resource: resource.to_string(),
        agent: "A".to_string(),
        next_holder: None,
    })
}

#[tokio::test]
async fn test_subscriber_gets_snapshot_first() {
    let broadcaster = Broadcaster::new(8);
    let mut subscription = broadcaster.subscribe_with(Vec::new);
    broadcaster.publish(notice("X"));

    assert_eq!(
        subscription.recv().await,
        Some(LiveMessage::Connected {
            active_locks: Vec::new()
        })
    );
    assert_eq!(
        subscription.recv().await.and_then(|m| m.resource().map(String::from)),
        Some("X".to_string())
    );
}

#[tokio::test]
async fn test_messages_arrive_in_publish_order() {
    let broadcaster = Broadcaster::new(16);
    let mut subscription = broadcaster.subscribe_with(Vec::new);
    subscription.try_recv();

    let lock_id = LockId::new();
    broadcaster.publish(LiveMessage::LockEvent(LockEvent::new(
        "A",
        "X",
        lock_id,
        LockEventDetails::Released { held_ms: 3 },
    )));
    broadcaster.publish(notice("X"));

    assert!(matches!(subscription.try_recv(), Some(LiveMessage::LockEvent(_))));
    assert!(matches!(subscription.try_recv(), Some(LiveMessage::LockReleased(_))));
    assert_eq!(subscription.try_recv(), None);
}

#[tokio::test]
async fn test_publish_without_subscribers_is_fine() {
    let broadcaster = Broadcaster::new(4);
    broadcaster.publish(notice("X"));
    assert_eq!(broadcaster.subscriber_count(), 0);
}

#[tokio::test]
async fn test_slow_subscriber_drops_oldest() {
    let broadcaster = Broadcaster::new(2);
    let mut subscription = broadcaster.subscribe_with(Vec::new);
    subscription.try_recv();

    for resource in ["a", "b", "c", "d", "e"] {
        broadcaster.publish(notice(resource));
    }

    let received: Vec<String> = std::iter::from_fn(|| subscription.try_recv())
        .filter_map(|m| m.resource().map(String::from))
        .collect();
    assert_eq!(received, vec!["d", "e"]);
    assert_eq!(subscription.dropped(), 3);
}

#[tokio::test]
async fn test_into_stream_yields_messages() {
    let broadcaster = Broadcaster::new(4);
    let subscription = broadcaster.subscribe_with(Vec::new);
    broadcaster.publish(notice("X"));
    drop(broadcaster);

    let messages: Vec<LiveMessage> = subscription.into_stream().collect().await;
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[0], LiveMessage::Connected { .. }));
}

#[tokio::test]
async fn test_live_message_wire_shape() {
    let json = serde_json::to_value(notice("X")).unwrap();
    assert_eq!(json["type"], "lock_released");
    assert_eq!(json["data"]["resource"], "X");

    let connected = serde_json::to_value(LiveMessage::Connected {
        active_locks: Vec::new(),
    })
    .unwrap();
    assert_eq!(connected["type"], "connected");
}

/// Records deliveries; fails the first `fail_first` of them.
struct RecordingSink {
    delivered: Mutex<Vec<LiveMessage>>,
    attempts: AtomicUsize,
    fail_first: usize,
}

impl RecordingSink {
    fn new(fail_first: usize) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            fail_first,
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, message: &LiveMessage) -> Result<(), anyhow::Error> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            anyhow::bail!("transport down");
        }
        self.delivered.lock().push(message.clone());
        Ok(())
    }

    fn accepts(&self, message: &LiveMessage) -> bool {
        !matches!(message, LiveMessage::LockEvent(_))
    }
}

#[tokio::test(start_paused = true)]
async fn test_forwarder_reconnects_with_fresh_snapshot() {
    let broadcaster = Broadcaster::new(8);
    let sink = Arc::new(RecordingSink::new(1));
    let snapshots = Arc::new(AtomicUsize::new(0));
    let counter = snapshots.clone();

    let handle = spawn_forwarder(
        broadcaster.clone(),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::<ActiveLock>::new()
        },
        sink.clone(),
        Duration::from_millis(100),
    );

    // First greeting fails, the forwarder backs off and resubscribes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    broadcaster.publish(notice("X"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    handle.stop().await;

    assert_eq!(snapshots.load(Ordering::SeqCst), 2);
    let delivered = sink.delivered.lock();
    assert!(matches!(delivered[0], LiveMessage::Connected { .. }));
    assert_eq!(delivered[1].resource(), Some("X"));
}

#[tokio::test]
async fn test_forwarder_skips_unaccepted_messages() {
    let broadcaster = Broadcaster::new(8);
    let sink = Arc::new(RecordingSink::new(0));
    let handle = spawn_forwarder(
        broadcaster.clone(),
        Vec::new,
        sink.clone(),
        Duration::from_millis(10),
    );

    // Let the forwarder subscribe before publishing.
    while broadcaster.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }
    broadcaster.publish(LiveMessage::LockEvent(LockEvent::new(
        "A",
        "X",
        LockId::new(),
        LockEventDetails::Released { held_ms: 0 },
    )));
    broadcaster.publish(notice("Y"));

    while sink.delivered.lock().len() < 2 {
        tokio::task::yield_now().await;
    }
    handle.stop().await;

    let delivered = sink.delivered.lock();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].resource(), Some("Y"));
}
