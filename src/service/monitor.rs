// ABOUTME: Background monitor - periodic expiry sweep, deadlock scan, and auto-resolution.
// ABOUTME: Runs on its own task until stopped through a watch channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::deadlock::{DeadlockDetector, DeadlockInfo, DeadlockResolver, Resolution, ResolutionStrategy};
use crate::lock::{LockId, LockManager, SweepReport};

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
    pub timed_out: Vec<LockId>,
    pub leases_expired: Vec<LockId>,
    pub deadlocks: Vec<DeadlockInfo>,
    pub resolutions: Vec<Resolution>,
}

impl MonitorReport {
    fn from_sweep(sweep: SweepReport) -> Self {
        Self {
            timed_out: sweep.timed_out,
            leases_expired: sweep.leases_expired,
            ..Self::default()
        }
    }
}

/// Everything a monitor pass touches.
pub(crate) struct MonitorParts {
    pub manager: LockManager,
    pub detector: Arc<DeadlockDetector>,
    pub resolver: Arc<DeadlockResolver>,
    pub config: MonitorConfig,
}

impl MonitorParts {
    /// Sweep expiries, detect deadlocks, and resolve them if configured to.
    pub(crate) fn scan(&self) -> MonitorReport {
        let mut report = MonitorReport::from_sweep(self.manager.sweep_expired());
        report.deadlocks = self.detector.detect();

        if !self.config.auto_resolve || report.deadlocks.is_empty() {
            return report;
        }
        if self.config.strategy == ResolutionStrategy::Manual {
            debug!(
                deadlocks = report.deadlocks.len(),
                "manual strategy configured, leaving deadlocks for an operator"
            );
            return report;
        }

        for info in &report.deadlocks {
            match self.resolver.resolve(&info.cycle, self.config.strategy, None) {
                Ok(resolution) => report.resolutions.push(resolution),
                Err(err) => {
                    warn!(deadlock_id = %info.deadlock_id, error = %err, "automatic deadlock resolution failed");
                }
            }
        }
        report
    }
}

/// Handle to the running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for the current pass to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "monitor task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_monitor(parts: MonitorParts) -> MonitorHandle {
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run(parts, shutdown_rx));
    MonitorHandle { shutdown, task }
}

async fn run(parts: MonitorParts, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(parts.config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval = ?parts.config.interval(), strategy = %parts.config.strategy, "concurrency monitor started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let report = parts.scan();
        if !report.resolutions.is_empty() || !report.timed_out.is_empty() || !report.leases_expired.is_empty() {
            debug!(
                timed_out = report.timed_out.len(),
                leases_expired = report.leases_expired.len(),
                deadlocks = report.deadlocks.len(),
                resolved = report.resolutions.len(),
                "monitor pass"
            );
        }
    }

    info!("concurrency monitor stopped");
}
