// ABOUTME: EventSink trait and forwarder that pumps the live feed into a transport.
// ABOUTME: On delivery failure the forwarder backs off and resubscribes with a fresh snapshot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::broadcaster::Broadcaster;
use super::types::LiveMessage;
use crate::lock::ActiveLock;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Destination for live feed messages (a websocket, an SSE stream, a log).
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one message.
    ///
    /// Returning `Err` drops the connection: the forwarder waits, then
    /// reconnects and starts again from a `connected` snapshot.
    async fn deliver(&self, message: &LiveMessage) -> Result<(), anyhow::Error>;

    /// Optional: filter which messages this sink cares about.
    /// Default returns true for all messages.
    fn accepts(&self, message: &LiveMessage) -> bool {
        let _ = message;
        true
    }
}

/// Handle to a running forwarder task.
pub struct ForwarderHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ForwarderHandle {
    /// Stop forwarding and wait for the task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "event forwarder task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) fn spawn_forwarder<F>(
    broadcaster: Broadcaster,
    snapshot: F,
    sink: Arc<dyn EventSink>,
    retry_delay: Duration,
) -> ForwarderHandle
where
    F: Fn() -> Vec<ActiveLock> + Send + Sync + 'static,
{
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(forward(broadcaster, snapshot, sink, shutdown_rx, retry_delay));
    ForwarderHandle { shutdown, task }
}

async fn forward<F>(
    broadcaster: Broadcaster,
    snapshot: F,
    sink: Arc<dyn EventSink>,
    mut shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
) where
    F: Fn() -> Vec<ActiveLock> + Send + Sync,
{
    let mut delay = retry_delay;

    loop {
        let mut subscription = broadcaster.subscribe_with(&snapshot);
        debug!("event sink connected");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.changed() => return,
                message = subscription.recv() => message,
            };

            let Some(message) = message else {
                debug!("live feed closed, forwarder exiting");
                return;
            };
            if !sink.accepts(&message) {
                continue;
            }
            match sink.deliver(&message).await {
                Ok(()) => delay = retry_delay,
                Err(err) => {
                    warn!(error = %err, retry_in = ?delay, "event sink delivery failed");
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            () = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}
