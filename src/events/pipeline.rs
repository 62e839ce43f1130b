// ABOUTME: Ordered hand-off from lock table mutations to the log, tracker, analytics, and feed.
// ABOUTME: Producers enqueue without blocking; a single task applies records in order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::broadcaster::Broadcaster;
use super::log::EventLog;
use super::types::{ConflictEvent, ConflictType, LiveMessage, LockEvent, ReleaseNotice};
use crate::conflict::{AnalyticsAggregator, ConflictTracker};
use crate::deadlock::DeadlockInfo;

/// Something that happened and must reach the observers.
#[derive(Debug, Clone)]
pub(crate) enum Record {
    Lock(LockEvent),
    Released(ReleaseNotice),
    Conflict(ConflictEvent),
    ConflictResolved(ConflictResolution),
    Deadlock(DeadlockInfo),
}

/// Closing details for a previously raised conflict.
#[derive(Debug, Clone)]
pub(crate) struct ConflictResolution {
    pub conflict_id: Uuid,
    pub resolution: String,
    pub auto_resolved: bool,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictResolution {
    pub(crate) fn now(conflict_id: Uuid, resolution: impl Into<String>, auto_resolved: bool) -> Self {
        Self {
            conflict_id,
            resolution: resolution.into(),
            auto_resolved,
            resolved_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum PipelineMsg {
    Record(Record),
    Flush(oneshot::Sender<()>),
}

/// Producer side of the pipeline. Cheap to clone.
#[derive(Clone)]
pub(crate) struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl PipelineHandle {
    /// A handle whose records are collected by the returned receiver
    /// instead of a pipeline task.
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<PipelineMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, record: Record) {
        if self.tx.send(PipelineMsg::Record(record)).is_err() {
            debug!("event pipeline closed, record dropped");
        }
    }

    /// Wait until every record emitted before this call has been applied.
    pub(crate) async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PipelineMsg::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Consumer side: applies records to every observer.
pub(crate) struct Pipeline {
    pub log: Arc<EventLog>,
    pub tracker: Arc<ConflictTracker>,
    pub analytics: Arc<AnalyticsAggregator>,
    pub broadcaster: Broadcaster,
}

impl Pipeline {
    /// Start the pipeline task.
    ///
    /// The task exits once every `PipelineHandle` has been dropped and the
    /// queue is drained.
    pub(crate) fn spawn(self) -> (PipelineHandle, JoinHandle<()>) {
        let (handle, mut rx) = PipelineHandle::detached();
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    PipelineMsg::Record(record) => self.apply(record),
                    PipelineMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("event pipeline drained");
        });
        (handle, task)
    }

    pub(crate) fn apply(&self, record: Record) {
        match record {
            Record::Lock(event) => {
                self.log.append(event.clone());
                self.analytics.record_lock_event(&event);
                self.broadcaster.publish(LiveMessage::LockEvent(event));
            }
            Record::Released(notice) => {
                self.broadcaster.publish(LiveMessage::LockReleased(notice));
            }
            Record::Conflict(conflict) => {
                self.tracker.record(conflict.clone());
                self.analytics.record_conflict();
                self.broadcaster.publish(LiveMessage::ConflictEvent(conflict));
            }
            Record::ConflictResolved(resolution) => {
                if let Some(updated) = self.tracker.resolve(&resolution) {
                    if updated.conflict_type == ConflictType::Deadlock {
                        self.analytics.record_deadlock_resolved();
                    }
                    self.broadcaster.publish(LiveMessage::ConflictEvent(updated));
                }
            }
            Record::Deadlock(info) => {
                self.broadcaster.publish(LiveMessage::DeadlockDetected(info));
            }
        }
    }
}
