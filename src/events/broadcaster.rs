// ABOUTME: Publish/subscribe fan-out of live lock, conflict, and deadlock messages.
// ABOUTME: Slow subscribers lose their oldest messages instead of blocking producers.

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

use super::types::LiveMessage;
use crate::lock::ActiveLock;

/// Fan-out hub for the live feed.
///
/// Every subscriber gets a `connected` snapshot first, then every message
/// published after it subscribed. Messages are delivered in publish order,
/// so events about the same lock are never reordered.
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<LiveMessage>,
}

impl Broadcaster {
    /// Create a broadcaster that buffers up to `buffer` undelivered
    /// messages per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is zero.
    pub fn new(buffer: usize) -> Self {
        assert!(buffer > 0, "buffer must be positive");
        let (tx, _) = broadcast::channel(buffer);
        Self { tx }
    }

    pub(crate) fn publish(&self, message: LiveMessage) {
        // No subscribers is not an error.
        let _ = self.tx.send(message);
    }

    /// Subscribe, using `snapshot` to build the `connected` message.
    ///
    /// The receiver is registered before the snapshot is taken, so any
    /// change missing from the snapshot arrives on the stream. A change can
    /// show up in both; consumers treat the feed as at-least-once.
    pub fn subscribe_with<F>(&self, snapshot: F) -> Subscription
    where
        F: FnOnce() -> Vec<ActiveLock>,
    {
        let rx = self.tx.subscribe();
        let active_locks = snapshot();
        Subscription {
            greeting: Some(LiveMessage::Connected { active_locks }),
            rx,
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One subscriber's view of the live feed.
pub struct Subscription {
    greeting: Option<LiveMessage>,
    rx: broadcast::Receiver<LiveMessage>,
    dropped: u64,
}

impl Subscription {
    /// Wait for the next message. Returns `None` once the feed is closed.
    pub async fn recv(&mut self) -> Option<LiveMessage> {
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }

        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<LiveMessage> {
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }

        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of messages this subscriber lost by falling behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Convert into a `Stream` of messages.
    pub fn into_stream(mut self) -> impl Stream<Item = LiveMessage> + Send {
        async_stream::stream! {
            while let Some(message) = self.recv().await {
                yield message;
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        warn!(skipped, total = self.dropped, "live subscriber fell behind, messages dropped");
    }
}
