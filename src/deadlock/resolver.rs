// ABOUTME: Breaks deadlocks by force-releasing one lock on the cycle.
// ABOUTME: The victim is chosen by strategy; the cycle is re-checked afterwards.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::detector::DeadlockDetector;
use super::graph::{HeldLock, canonical};
use crate::error::{LockError, ResolveError};
use crate::events::pipeline::{ConflictResolution, PipelineHandle, Record};
use crate::events::{ConflictEvent, ConflictType, OverrideCause};
use crate::lock::{LockId, LockManager};

/// How a deadlock victim is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Release the lock with the numerically highest (least urgent)
    /// priority; ties go to the longest-held lock.
    Priority,
    /// Release the most recently acquired lock.
    Youngest,
    /// Release the earliest acquired lock.
    Oldest,
    /// Release a uniformly random lock on the cycle.
    Random,
    /// Release the lock the caller names.
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionStrategy::Priority => "priority",
            ResolutionStrategy::Youngest => "youngest",
            ResolutionStrategy::Oldest => "oldest",
            ResolutionStrategy::Random => "random",
            ResolutionStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" => Ok(ResolutionStrategy::Priority),
            "youngest" => Ok(ResolutionStrategy::Youngest),
            "oldest" => Ok(ResolutionStrategy::Oldest),
            "random" => Ok(ResolutionStrategy::Random),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(format!("unknown resolution strategy '{other}'")),
        }
    }
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// Locks that were force-released. Empty when the cycle had already
    /// dissolved.
    pub victims: Vec<LockId>,
    /// False if the cycle was still present after the last release.
    pub cycle_broken: bool,
}

impl Resolution {
    /// True if nothing had to be released.
    pub fn was_noop(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Force-releases deadlock victims.
pub struct DeadlockResolver {
    manager: LockManager,
    detector: Arc<DeadlockDetector>,
    pipeline: PipelineHandle,
}

impl DeadlockResolver {
    pub(crate) fn new(
        manager: LockManager,
        detector: Arc<DeadlockDetector>,
        pipeline: PipelineHandle,
    ) -> Self {
        Self {
            manager,
            detector,
            pipeline,
        }
    }

    /// Break `cycle` using `strategy`.
    ///
    /// `victim` is required for [`ResolutionStrategy::Manual`] and must be a
    /// lock on the cycle; it is ignored otherwise. A cycle that has already
    /// dissolved resolves successfully with no victims.
    pub fn resolve(
        &self,
        cycle: &[String],
        strategy: ResolutionStrategy,
        victim: Option<LockId>,
    ) -> Result<Resolution, ResolveError> {
        if cycle.len() < 2 {
            return Err(ResolveError::EmptyCycle);
        }
        let manual_victim = match (strategy, victim) {
            (ResolutionStrategy::Manual, None) => return Err(ResolveError::MissingVictim),
            (ResolutionStrategy::Manual, Some(id)) => Some(id),
            _ => None,
        };

        let cycle = canonical(cycle);
        let reason = format!("deadlock resolution: strategy={strategy}");
        let mut victims = Vec::new();

        // Parallel edges can keep a cycle alive after one release, so keep
        // going until it is gone. Each round removes a lock, which bounds
        // the loop by the cycle's lock count.
        loop {
            let graph = self.detector.graph();
            if !graph.has_cycle(&cycle) {
                break;
            }
            let candidates = graph.locks_on_cycle(&cycle);

            let chosen = match manual_victim {
                Some(id) => {
                    if !victims.is_empty() {
                        break;
                    }
                    if !candidates.iter().any(|lock| lock.lock_id == id) {
                        return Err(ResolveError::VictimNotInCycle { victim: id });
                    }
                    id
                }
                None => match select_victim(strategy, &candidates) {
                    Some(lock) => {
                        debug!(lock_id = %lock.lock_id, holder = %lock.holder, %strategy, "deadlock victim selected");
                        lock.lock_id
                    }
                    None => break,
                },
            };

            match self
                .manager
                .force_release(chosen, reason.clone(), OverrideCause::DeadlockResolution)
            {
                Ok(()) => victims.push(chosen),
                // Released by someone else since the snapshot; look again.
                Err(LockError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let cycle_broken = !self.detector.is_deadlocked(&cycle);
        let conflict_id = self.detector.forget(&cycle);

        if victims.is_empty() {
            debug!(cycle = ?cycle, "deadlock already dissolved, nothing released");
            return Ok(Resolution {
                strategy,
                victims,
                cycle_broken,
            });
        }

        let conflict_id = conflict_id.unwrap_or_else(|| {
            let conflict = ConflictEvent::new(
                ConflictType::Deadlock,
                cycle.clone(),
                format!("circular wait: {}", cycle.join(" -> ")),
            );
            let id = conflict.conflict_id;
            self.pipeline.emit(Record::Conflict(conflict));
            id
        });
        let summary = format!(
            "released {} lock(s) by strategy={strategy}",
            victims.len()
        );
        self.pipeline.emit(Record::ConflictResolved(ConflictResolution::now(
            conflict_id,
            summary,
            strategy != ResolutionStrategy::Manual,
        )));

        if cycle_broken {
            info!(cycle = ?cycle, %strategy, victims = victims.len(), "deadlock resolved");
        } else {
            warn!(cycle = ?cycle, %strategy, "deadlock persists after resolution");
        }

        Ok(Resolution {
            strategy,
            victims,
            cycle_broken,
        })
    }
}

/// Pick a victim among the locks on a cycle.
pub(crate) fn select_victim(strategy: ResolutionStrategy, candidates: &[HeldLock]) -> Option<&HeldLock> {
    let age = |lock: &&HeldLock| (lock.acquired_at, lock.grant_seq);
    match strategy {
        ResolutionStrategy::Priority => candidates.iter().max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| age(b).cmp(&age(a)))
        }),
        ResolutionStrategy::Youngest => candidates.iter().max_by_key(age),
        ResolutionStrategy::Oldest => candidates.iter().min_by_key(age),
        ResolutionStrategy::Random => candidates.choose(&mut rand::thread_rng()),
        ResolutionStrategy::Manual => None,
    }
}

impl fmt::Debug for DeadlockResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlockResolver").finish_non_exhaustive()
    }
}
