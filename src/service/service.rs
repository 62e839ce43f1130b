// ABOUTME: ConcurrencyService - the constructed, owned entry point to the lock system.
// ABOUTME: Wires the manager, pipeline, detector, resolver, feed, and monitor together.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::monitor::{MonitorHandle, MonitorParts, MonitorReport, spawn_monitor};
use crate::config::ManagerConfig;
use crate::conflict::{AnalyticsAggregator, ConcurrencyAnalytics, ConflictPattern, ConflictTracker};
use crate::deadlock::{DeadlockDetector, DeadlockInfo, DeadlockResolver, Resolution, ResolutionStrategy};
use crate::error::{ConfigError, LockError, ResolveError};
use crate::events::pipeline::{Pipeline, PipelineHandle};
use crate::events::{
    Broadcaster, ConflictEvent, EventLog, EventSink, ForwarderHandle, LockEvent, Subscription,
    spawn_forwarder,
};
use crate::lock::{AcquireRequest, Acquisition, ActiveLock, LockGrant, LockId, LockManager};

const SINK_RETRY_DELAY: Duration = Duration::from_millis(500);

/// The tool lock service.
///
/// Construct one per process (inside a tokio runtime) and share it by
/// reference or `Arc`. Queries that read the event log, conflict history,
/// or analytics first wait for every earlier mutation to be recorded.
pub struct ConcurrencyService {
    config: Arc<ManagerConfig>,
    manager: LockManager,
    detector: Arc<DeadlockDetector>,
    resolver: Arc<DeadlockResolver>,
    pipeline: PipelineHandle,
    log: Arc<EventLog>,
    tracker: Arc<ConflictTracker>,
    analytics: Arc<AnalyticsAggregator>,
    broadcaster: Broadcaster,
    pipeline_task: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl ConcurrencyService {
    /// Validate `config` and start the service.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: ManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let log = Arc::new(EventLog::new(config.history_size));
        let tracker = Arc::new(ConflictTracker::new(config.conflict_history_size));
        let analytics = Arc::new(AnalyticsAggregator::new());
        let broadcaster = Broadcaster::new(config.subscriber_buffer);

        let (pipeline, pipeline_task) = Pipeline {
            log: log.clone(),
            tracker: tracker.clone(),
            analytics: analytics.clone(),
            broadcaster: broadcaster.clone(),
        }
        .spawn();

        let manager = LockManager::new(config.clone(), pipeline.clone());
        let detector = Arc::new(DeadlockDetector::new(
            manager.clone(),
            config.severity.clone(),
            pipeline.clone(),
        ));
        let resolver = Arc::new(DeadlockResolver::new(
            manager.clone(),
            detector.clone(),
            pipeline.clone(),
        ));

        debug!(history_size = config.history_size, "concurrency service started");
        Ok(Self {
            config,
            manager,
            detector,
            resolver,
            pipeline,
            log,
            tracker,
            analytics,
            broadcaster,
            pipeline_task: Mutex::new(Some(pipeline_task)),
            monitor: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The lock manager, for callers that want `request`, `run_exclusive`,
    /// or `mark_executing`.
    pub fn manager(&self) -> &LockManager {
        &self.manager
    }

    pub async fn acquire(&self, request: AcquireRequest) -> Result<LockGrant, LockError> {
        self.manager.acquire(request).await
    }

    pub fn request(&self, request: AcquireRequest) -> Result<Acquisition, LockError> {
        self.manager.request(request)
    }

    pub fn release(&self, lock_id: LockId) -> Result<(), LockError> {
        self.manager.release(lock_id)
    }

    pub fn override_lock(&self, lock_id: LockId, reason: &str) -> Result<(), LockError> {
        self.manager.override_lock(lock_id, reason)
    }

    pub fn active_locks(&self) -> Vec<ActiveLock> {
        self.manager.active_locks()
    }

    pub fn lock_details(&self, lock_id: LockId) -> Option<ActiveLock> {
        self.manager.lock_details(lock_id)
    }

    /// Most recent lock events, newest first.
    pub async fn history(&self, limit: usize) -> Vec<LockEvent> {
        self.flush().await;
        self.log.recent(limit)
    }

    /// Every retained event for one lock, oldest first.
    pub async fn lock_history(&self, lock_id: LockId) -> Vec<LockEvent> {
        self.flush().await;
        self.log.for_lock(lock_id)
    }

    pub async fn resource_history(&self, resource: &str, limit: usize) -> Vec<LockEvent> {
        self.flush().await;
        self.log.for_resource(resource, limit)
    }

    pub async fn agent_history(&self, agent: &str, limit: usize) -> Vec<LockEvent> {
        self.flush().await;
        self.log.for_agent(agent, limit)
    }

    /// Most recent conflicts, newest first.
    pub async fn conflicts(&self, limit: usize) -> Vec<ConflictEvent> {
        self.flush().await;
        self.tracker.recent(limit)
    }

    pub async fn unresolved_conflicts(&self) -> Vec<ConflictEvent> {
        self.flush().await;
        self.tracker.unresolved()
    }

    /// Agent pairs that conflict most, by count.
    pub async fn conflict_patterns(&self, top_n: usize) -> Vec<ConflictPattern> {
        self.flush().await;
        self.tracker.patterns(top_n)
    }

    pub async fn analytics(&self) -> ConcurrencyAnalytics {
        self.flush().await;
        let top_n = self.config.top_n;
        self.analytics.snapshot(top_n, self.tracker.patterns(top_n))
    }

    pub fn detect_deadlocks(&self) -> Vec<DeadlockInfo> {
        self.detector.detect()
    }

    pub fn resolve_deadlock(
        &self,
        cycle: &[String],
        strategy: ResolutionStrategy,
        victim: Option<LockId>,
    ) -> Result<Resolution, ResolveError> {
        self.resolver.resolve(cycle, strategy, victim)
    }

    /// Subscribe to the live feed, starting with a snapshot of held locks.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe_with(|| self.manager.active_locks())
    }

    /// Push the live feed into `sink` until the returned handle is stopped.
    pub fn forward_to(&self, sink: Arc<dyn EventSink>) -> ForwarderHandle {
        let manager = self.manager.clone();
        spawn_forwarder(
            self.broadcaster.clone(),
            move || manager.active_locks(),
            sink,
            SINK_RETRY_DELAY,
        )
    }

    /// Start the background monitor. Returns false if it is already running.
    pub fn start_monitoring(&self) -> bool {
        let mut monitor = self.monitor.lock();
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        *monitor = Some(spawn_monitor(self.monitor_parts()));
        true
    }

    /// Stop the background monitor. Returns false if it was not running.
    pub async fn stop_monitoring(&self) -> bool {
        let handle = self.monitor.lock().take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run one monitor pass now, on the caller's task.
    pub fn scan_once(&self) -> MonitorReport {
        self.monitor_parts().scan()
    }

    /// Wait until every mutation so far has reached the log and the feed.
    pub async fn flush(&self) {
        self.pipeline.flush().await;
    }

    /// Stop the monitor, fail queued requests with `Closed`, and drain the
    /// event pipeline. Held locks stay held and can still be released.
    pub async fn shutdown(&self) {
        self.stop_monitoring().await;
        let cancelled = self.manager.close();
        self.flush().await;
        info!(cancelled, active = self.manager.active_count(), "concurrency service shut down");
    }

    fn monitor_parts(&self) -> MonitorParts {
        MonitorParts {
            manager: self.manager.clone(),
            detector: self.detector.clone(),
            resolver: self.resolver.clone(),
            config: self.config.monitor.clone(),
        }
    }
}

impl Drop for ConcurrencyService {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
        if let Some(task) = self.pipeline_task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ConcurrencyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
