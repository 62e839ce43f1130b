// ABOUTME: Records conflict events and aggregates recurring patterns per agent pair.
// ABOUTME: Pair statistics are updated incrementally on record and on resolution.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::pipeline::ConflictResolution;
use crate::events::ConflictEvent;

/// Recurring conflicts between an unordered pair of agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPattern {
    /// Lexicographically smaller agent of the pair.
    pub agent_a: String,
    pub agent_b: String,
    pub conflict_count: u64,
    pub last_conflict: DateTime<Utc>,
    /// Mean milliseconds from detection to resolution over resolved
    /// conflicts. Zero until one is resolved.
    pub avg_resolution_ms: f64,
}

#[derive(Debug, Clone)]
struct PairStats {
    conflict_count: u64,
    last_conflict: DateTime<Utc>,
    resolved_samples: u64,
    avg_resolution_ms: f64,
}

#[derive(Default)]
struct TrackerState {
    history: VecDeque<ConflictEvent>,
    pairs: HashMap<(String, String), PairStats>,
}

/// Conflict history plus per-pair aggregation.
pub struct ConflictTracker {
    state: Mutex<TrackerState>,
    capacity: usize,
}

impl ConflictTracker {
    /// Create a tracker retaining at most `capacity` conflicts.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");

        Self {
            state: Mutex::new(TrackerState::default()),
            capacity,
        }
    }

    pub(crate) fn record(&self, event: ConflictEvent) {
        let mut state = self.state.lock();

        for key in pair_keys(&event.involved_agents) {
            let stats = state.pairs.entry(key).or_insert_with(|| PairStats {
                conflict_count: 0,
                last_conflict: event.timestamp,
                resolved_samples: 0,
                avg_resolution_ms: 0.0,
            });
            stats.conflict_count += 1;
            stats.last_conflict = stats.last_conflict.max(event.timestamp);
        }

        if state.history.len() == self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(event);
    }

    /// Close a conflict. Returns the updated record, or `None` if the
    /// conflict is unknown or was already resolved.
    pub(crate) fn resolve(&self, resolution: &ConflictResolution) -> Option<ConflictEvent> {
        let mut state = self.state.lock();

        let event = state
            .history
            .iter_mut()
            .find(|e| e.conflict_id == resolution.conflict_id)?;
        if event.is_resolved() {
            return None;
        }
        event.resolution = Some(resolution.resolution.clone());
        event.auto_resolved = resolution.auto_resolved;
        event.resolved_at = Some(resolution.resolved_at);
        let updated = event.clone();

        let elapsed_ms = (resolution.resolved_at - updated.timestamp)
            .num_milliseconds()
            .max(0) as f64;
        for key in pair_keys(&updated.involved_agents) {
            if let Some(stats) = state.pairs.get_mut(&key) {
                stats.resolved_samples += 1;
                stats.avg_resolution_ms +=
                    (elapsed_ms - stats.avg_resolution_ms) / stats.resolved_samples as f64;
            }
        }

        Some(updated)
    }

    /// The `limit` most recent conflicts, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ConflictEvent> {
        let state = self.state.lock();
        state.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn get(&self, conflict_id: Uuid) -> Option<ConflictEvent> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .find(|e| e.conflict_id == conflict_id)
            .cloned()
    }

    /// Retained conflicts that have not been resolved, oldest first.
    pub fn unresolved(&self) -> Vec<ConflictEvent> {
        let state = self.state.lock();
        state
            .history
            .iter()
            .filter(|e| !e.is_resolved())
            .cloned()
            .collect()
    }

    /// Top `top_n` agent pairs by conflict count.
    ///
    /// Ties go to the most recent conflict, then to agent names.
    pub fn patterns(&self, top_n: usize) -> Vec<ConflictPattern> {
        let state = self.state.lock();
        let mut patterns: Vec<_> = state
            .pairs
            .iter()
            .map(|((a, b), stats)| to_pattern(a, b, stats))
            .collect();
        patterns.sort_by(|x, y| {
            y.conflict_count
                .cmp(&x.conflict_count)
                .then_with(|| y.last_conflict.cmp(&x.last_conflict))
                .then_with(|| (&x.agent_a, &x.agent_b).cmp(&(&y.agent_a, &y.agent_b)))
        });
        patterns.truncate(top_n);
        patterns
    }

    /// Pattern for one pair, in either order.
    pub fn pattern(&self, agent_a: &str, agent_b: &str) -> Option<ConflictPattern> {
        let key = pair_key(agent_a, agent_b);
        let state = self.state.lock();
        state.pairs.get(&key).map(|stats| to_pattern(&key.0, &key.1, stats))
    }
}

fn to_pattern(agent_a: &str, agent_b: &str, stats: &PairStats) -> ConflictPattern {
    ConflictPattern {
        agent_a: agent_a.to_string(),
        agent_b: agent_b.to_string(),
        conflict_count: stats.conflict_count,
        last_conflict: stats.last_conflict,
        avg_resolution_ms: stats.avg_resolution_ms,
    }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Every unordered pair of distinct agents.
fn pair_keys(agents: &[String]) -> Vec<(String, String)> {
    let mut unique: Vec<&String> = agents.iter().collect();
    unique.sort();
    unique.dedup();

    let mut keys = Vec::new();
    for (i, a) in unique.iter().enumerate() {
        for b in &unique[i + 1..] {
            keys.push(((*a).clone(), (*b).clone()));
        }
    }
    keys
}
