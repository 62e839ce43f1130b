// ABOUTME: Core lock types - priorities, lock ids, requests, and active lock views.
// ABOUTME: These are the wire shapes returned by queries and carried by events.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::LockError;

/// Request priority. 1 is the most urgent, 10 the least.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const LOWEST: Priority = Priority(10);

    /// Create a priority, rejecting values outside 1..=10.
    pub fn new(value: u8) -> Result<Self, LockError> {
        if (1..=10).contains(&value) {
            Ok(Self(value))
        } else {
            Err(LockError::InvalidPriority(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Returns true if `self` is strictly more urgent than `other`.
    pub fn outranks(self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a lock.
///
/// A request is assigned its lock id when it is made, so the `queued`,
/// `acquired`, and `timeout` events for one request all carry the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LockId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a held lock is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Acquired,
    Executing,
    Releasing,
}

/// A request waiting in a resource's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    /// Lock id the request will hold once granted.
    pub request_id: LockId,
    pub agent: String,
    pub resource: String,
    pub priority: Priority,
    pub requested_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub retry_count: u32,
}

/// The current holder of a resource plus its waiting queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveLock {
    pub resource: String,
    pub lock_id: LockId,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub context_id: Option<String>,
    /// Waiters in grant order: priority ascending, then request time.
    pub waiting_queue: Vec<LockRequest>,
    pub stage: ExecutionStage,
}

/// Parameters for acquiring a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    pub agent: String,
    pub resource: String,
    /// Raw priority, validated when the request is made.
    pub priority: u8,
    /// How long to wait in the queue. Falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Caller-maintained retry counter, recorded but never acted on.
    pub retry_count: u32,
    /// Identifier of the caller's execution context (task, thread, run).
    pub context_id: Option<String>,
    /// Soft lease on the grant. Falls back to the configured default.
    pub lease: Option<Duration>,
}

impl AcquireRequest {
    /// Request `resource` for `agent` at normal priority.
    pub fn new(agent: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            resource: resource.into(),
            priority: Priority::NORMAL.value(),
            timeout: None,
            retry_count: 0,
            context_id: None,
            lease: None,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// Wall-clock and monotonic instants `span` after `wall`/`mono`, or `None`
/// if either clock cannot represent them.
pub(crate) fn expiry_after(
    wall: DateTime<Utc>,
    mono: Instant,
    span: Duration,
) -> Option<(DateTime<Utc>, Instant)> {
    let wall = wall.checked_add_signed(chrono::Duration::from_std(span).ok()?)?;
    Some((wall, mono.checked_add(span)?))
}

/// Proof that an agent holds a resource. Pass `lock_id` to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub lock_id: LockId,
    pub agent: String,
    pub resource: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    /// Time spent in the waiting queue. Zero for immediate grants.
    pub waited: Duration,
}
