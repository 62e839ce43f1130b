// ABOUTME: Event records - lock lifecycle events, conflicts, and live feed messages.
// ABOUTME: Details are a tagged union per event kind rather than a free-form map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deadlock::DeadlockInfo;
use crate::lock::{ActiveLock, LockId, Priority};

/// Kind of lock lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
    Acquired,
    Released,
    Queued,
    Timeout,
    Overridden,
}

impl std::fmt::Display for LockEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockEventKind::Acquired => write!(f, "acquired"),
            LockEventKind::Released => write!(f, "released"),
            LockEventKind::Queued => write!(f, "queued"),
            LockEventKind::Timeout => write!(f, "timeout"),
            LockEventKind::Overridden => write!(f, "overridden"),
        }
    }
}

/// Why a lock was taken away from its holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideCause {
    /// Explicit administrative override.
    Administrator,
    /// Chosen as the victim to break a deadlock.
    DeadlockResolution,
    /// The holder's soft lease ran out.
    LeaseExpired,
}

/// Event-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockEventDetails {
    Acquired {
        priority: Priority,
        /// Milliseconds spent queued; absent for immediate grants.
        waited_ms: Option<u64>,
        /// The lock whose release handed this resource over.
        previous_lock_id: Option<LockId>,
    },
    Queued {
        priority: Priority,
        /// 1-based position in the waiting queue.
        queue_position: usize,
        holder: String,
    },
    Released {
        held_ms: u64,
    },
    Timeout {
        waited_ms: u64,
        timeout_ms: u64,
    },
    Overridden {
        reason: String,
        cause: OverrideCause,
        held_ms: u64,
    },
}

impl LockEventDetails {
    pub fn kind(&self) -> LockEventKind {
        match self {
            LockEventDetails::Acquired { .. } => LockEventKind::Acquired,
            LockEventDetails::Queued { .. } => LockEventKind::Queued,
            LockEventDetails::Released { .. } => LockEventKind::Released,
            LockEventDetails::Timeout { .. } => LockEventKind::Timeout,
            LockEventDetails::Overridden { .. } => LockEventKind::Overridden,
        }
    }
}

/// Immutable record of a lock lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: LockEventKind,
    pub agent: String,
    pub resource: String,
    pub lock_id: LockId,
    pub details: LockEventDetails,
}

impl LockEvent {
    pub(crate) fn new(
        agent: impl Into<String>,
        resource: impl Into<String>,
        lock_id: LockId,
        details: LockEventDetails,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type: details.kind(),
            agent: agent.into(),
            resource: resource.into(),
            lock_id,
            details,
        }
    }
}

/// Category of a concurrency anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Deadlock,
    Timeout,
    ResourceExhaustion,
    PriorityInversion,
}

/// A recorded concurrency anomaly. Resolution fields are set at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub conflict_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub conflict_type: ConflictType,
    pub involved_agents: Vec<String>,
    pub description: String,
    pub resolution: Option<String>,
    pub auto_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictEvent {
    pub(crate) fn new(
        conflict_type: ConflictType,
        involved_agents: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            conflict_type,
            involved_agents,
            description: description.into(),
            resolution: None,
            auto_resolved: false,
            resolved_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Summary pushed to live subscribers whenever a lock is given up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNotice {
    pub lock_id: LockId,
    pub resource: String,
    pub agent: String,
    /// Agent the resource was handed to, if anyone was waiting.
    pub next_holder: Option<String>,
}

/// A message on the live feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LiveMessage {
    /// First message on every subscription.
    Connected { active_locks: Vec<ActiveLock> },
    LockEvent(LockEvent),
    ConflictEvent(ConflictEvent),
    DeadlockDetected(DeadlockInfo),
    LockReleased(ReleaseNotice),
}

impl LiveMessage {
    /// Resource the message is about, if it concerns a single resource.
    pub fn resource(&self) -> Option<&str> {
        match self {
            LiveMessage::LockEvent(event) => Some(&event.resource),
            LiveMessage::LockReleased(notice) => Some(&notice.resource),
            _ => None,
        }
    }
}
