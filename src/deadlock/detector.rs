// ABOUTME: Deadlock detection over the live lock table.
// ABOUTME: Reports each wait-for cycle once, with a severity and the locks involved.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::graph::{WaitForGraph, canonical};
use crate::config::SeverityPolicy;
use crate::events::pipeline::{PipelineHandle, Record};
use crate::events::{ConflictEvent, ConflictType};
use crate::lock::{LockId, LockManager, Priority};

/// How urgent a deadlock is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        f.write_str(name)
    }
}

impl Severity {
    /// Classify a cycle by its length and its participants' most urgent
    /// priorities.
    pub fn classify(cycle_len: usize, priorities: &[Priority], policy: &SeverityPolicy) -> Self {
        let most_urgent = priorities.iter().min().map(|p| p.value());

        if cycle_len >= policy.high_cycle_len
            || most_urgent.is_some_and(|p| p <= policy.high_priority_max)
        {
            return Severity::High;
        }
        if cycle_len == 2 && most_urgent.is_some_and(|p| p >= policy.low_priority_min) {
            return Severity::Low;
        }
        Severity::Medium
    }
}

/// A detected circular wait.
///
/// `cycle[i]` waits on a resource held by `cycle[i + 1]`, and the last
/// agent waits on the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockInfo {
    pub cycle: Vec<String>,
    pub deadlock_id: Uuid,
    pub detected_at: DateTime<Utc>,
    pub involved_locks: Vec<LockId>,
    pub severity: Severity,
}

impl DeadlockInfo {
    /// `A -> B -> A` rendering of the cycle.
    pub fn describe(&self) -> String {
        let mut path = self.cycle.join(" -> ");
        if let Some(first) = self.cycle.first() {
            path.push_str(" -> ");
            path.push_str(first);
        }
        path
    }
}

struct Reported {
    info: DeadlockInfo,
    conflict_id: Uuid,
}

/// Finds circular waits in the lock table.
///
/// A cycle is raised (conflict + live message) the first time it is seen and
/// re-reported quietly while it persists. Cycles that disappear are
/// forgotten, so a later recurrence is raised again.
pub struct DeadlockDetector {
    manager: LockManager,
    policy: SeverityPolicy,
    pipeline: PipelineHandle,
    reported: Mutex<HashMap<Vec<String>, Reported>>,
}

impl DeadlockDetector {
    pub(crate) fn new(manager: LockManager, policy: SeverityPolicy, pipeline: PipelineHandle) -> Self {
        Self {
            manager,
            policy,
            pipeline,
            reported: Mutex::new(HashMap::new()),
        }
    }

    /// Every cycle currently present in the wait-for graph.
    pub fn detect(&self) -> Vec<DeadlockInfo> {
        let graph = self.graph();
        let cycles = graph.cycles();

        let mut reported = self.reported.lock();
        reported.retain(|cycle, _| graph.has_cycle(cycle));

        let mut found = Vec::with_capacity(cycles.len());
        for cycle in cycles {
            if let Some(known) = reported.get(&cycle) {
                found.push(known.info.clone());
                continue;
            }

            let priorities: Vec<Priority> = cycle
                .iter()
                .filter_map(|agent| graph.urgency(agent))
                .collect();
            let info = DeadlockInfo {
                deadlock_id: Uuid::new_v4(),
                detected_at: Utc::now(),
                involved_locks: graph
                    .locks_on_cycle(&cycle)
                    .into_iter()
                    .map(|lock| lock.lock_id)
                    .collect(),
                severity: Severity::classify(cycle.len(), &priorities, &self.policy),
                cycle: cycle.clone(),
            };

            warn!(
                cycle = %info.describe(),
                severity = %info.severity,
                deadlock_id = %info.deadlock_id,
                "deadlock detected"
            );
            let conflict = ConflictEvent::new(
                ConflictType::Deadlock,
                cycle.clone(),
                format!("circular wait: {}", info.describe()),
            );
            let conflict_id = conflict.conflict_id;
            self.pipeline.emit(Record::Conflict(conflict));
            self.pipeline.emit(Record::Deadlock(info.clone()));

            found.push(info.clone());
            reported.insert(cycle, Reported { info, conflict_id });
        }

        debug!(cycles = found.len(), edges = graph.edge_count(), "deadlock scan finished");
        found
    }

    /// True while every edge of `cycle` is still in the graph.
    pub fn is_deadlocked(&self, cycle: &[String]) -> bool {
        self.graph().has_cycle(&canonical(cycle))
    }

    /// Stop tracking a cycle, returning the conflict raised for it.
    pub(crate) fn forget(&self, cycle: &[String]) -> Option<Uuid> {
        self.reported
            .lock()
            .remove(&canonical(cycle))
            .map(|known| known.conflict_id)
    }

    pub(crate) fn graph(&self) -> WaitForGraph {
        WaitForGraph::from_snapshot(&self.manager.snapshot())
    }
}

impl fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
