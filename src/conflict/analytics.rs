// ABOUTME: Rolling counters and top-N views over lock and conflict activity.
// ABOUTME: Averages are running means; nothing is recomputed from full history.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::tracker::ConflictPattern;
use crate::events::{LockEvent, LockEventDetails};

/// Lock count for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentActivity {
    pub agent: String,
    pub lock_count: u64,
}

/// Conflict count for one agent pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictHotspot {
    pub agent_a: String,
    pub agent_b: String,
    pub conflict_count: u64,
}

impl From<ConflictPattern> for ConflictHotspot {
    fn from(pattern: ConflictPattern) -> Self {
        Self {
            agent_a: pattern.agent_a,
            agent_b: pattern.agent_b,
            conflict_count: pattern.conflict_count,
        }
    }
}

/// Point-in-time analytics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyAnalytics {
    pub total_locks_acquired: u64,
    pub total_locks_released: u64,
    pub conflicts_detected: u64,
    pub deadlocks_resolved: u64,
    pub most_active_agents: Vec<AgentActivity>,
    pub conflict_hotspots: Vec<ConflictHotspot>,
    /// Mean hold time of released and overridden locks.
    pub avg_lock_duration_ms: f64,
}

#[derive(Default)]
struct Counters {
    acquired: u64,
    released: u64,
    conflicts: u64,
    deadlocks_resolved: u64,
    per_agent: HashMap<String, u64>,
    avg_hold_ms: f64,
}

/// Incrementally maintained analytics.
#[derive(Default)]
pub struct AnalyticsAggregator {
    counters: Mutex<Counters>,
}

impl AnalyticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lock_event(&self, event: &LockEvent) {
        let mut guard = self.counters.lock();
        let counters = &mut *guard;
        match &event.details {
            LockEventDetails::Acquired { .. } => {
                counters.acquired += 1;
                *counters.per_agent.entry(event.agent.clone()).or_insert(0) += 1;
            }
            LockEventDetails::Released { held_ms } | LockEventDetails::Overridden { held_ms, .. } => {
                counters.released += 1;
                let delta = (*held_ms as f64 - counters.avg_hold_ms) / counters.released as f64;
                counters.avg_hold_ms += delta;
            }
            LockEventDetails::Queued { .. } | LockEventDetails::Timeout { .. } => {}
        }
    }

    pub(crate) fn record_conflict(&self) {
        self.counters.lock().conflicts += 1;
    }

    pub(crate) fn record_deadlock_resolved(&self) {
        self.counters.lock().deadlocks_resolved += 1;
    }

    /// Build a snapshot, sorting the per-agent counts on the way out.
    pub fn snapshot(&self, top_n: usize, hotspots: Vec<ConflictPattern>) -> ConcurrencyAnalytics {
        let counters = self.counters.lock();

        let mut most_active: Vec<AgentActivity> = counters
            .per_agent
            .iter()
            .map(|(agent, count)| AgentActivity {
                agent: agent.clone(),
                lock_count: *count,
            })
            .collect();
        most_active.sort_by(|a, b| {
            b.lock_count
                .cmp(&a.lock_count)
                .then_with(|| a.agent.cmp(&b.agent))
        });
        most_active.truncate(top_n);

        ConcurrencyAnalytics {
            total_locks_acquired: counters.acquired,
            total_locks_released: counters.released,
            conflicts_detected: counters.conflicts,
            deadlocks_resolved: counters.deadlocks_resolved,
            most_active_agents: most_active,
            conflict_hotspots: hotspots.into_iter().take(top_n).map(Into::into).collect(),
            avg_lock_duration_ms: counters.avg_hold_ms,
        }
    }
}
